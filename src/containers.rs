//! Growable concurrent containers and a plain mutex, re-exported under the
//! names the rest of the framework uses.

/// Append-only vector; pushes and indexed reads never block each other.
pub type ConcurrentVec<T> = boxcar::Vec<T>;

/// Unbounded MPMC queue.
pub type ConcurrentQueue<T> = crossbeam_queue::SegQueue<T>;

pub type Mutex<T> = parking_lot::Mutex<T>;
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_and_queue_accept_concurrent_pushes() {
        let v: ConcurrentVec<usize> = ConcurrentVec::new();
        let q: ConcurrentQueue<usize> = ConcurrentQueue::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let (v, q) = (&v, &q);
                s.spawn(move || {
                    for i in 0..100 {
                        v.push(t * 100 + i);
                        q.push(t * 100 + i);
                    }
                });
            }
        });
        assert_eq!(v.count(), 400);
        assert_eq!(q.len(), 400);
        let mut drained: Vec<usize> = std::iter::from_fn(|| q.pop()).collect();
        drained.sort_unstable();
        assert_eq!(drained, (0..400).collect::<Vec<_>>());
    }
}
