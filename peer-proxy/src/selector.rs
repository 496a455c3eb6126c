use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks the peer a request is forwarded to.
pub trait PeerSelector: Send + Sync {
    fn select<'a>(&self, candidates: &'a [String]) -> Option<&'a String>;
}

/// Uniformly random choice.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSelector;

impl PeerSelector for RandomSelector {
    fn select<'a>(&self, candidates: &'a [String]) -> Option<&'a String> {
        candidates.choose(&mut rand::thread_rng())
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl PeerSelector for RoundRobinSelector {
    fn select<'a>(&self, candidates: &'a [String]) -> Option<&'a String> {
        if candidates.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        candidates.get(n % candidates.len())
    }
}
