//! Provider selection strategies for the connection pool.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Random,
    RoundRobin,
    /// Stable choice per host: hash of the local host name.
    HashLocal,
}

static LOCAL_HOST: Lazy<String> = Lazy::new(|| {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
});

pub(crate) struct RouteSelector {
    strategy: Strategy,
    rr_index: AtomicUsize,
}

impl RouteSelector {
    pub(crate) fn new(strategy: Strategy) -> Self {
        Self { strategy, rr_index: AtomicUsize::new(0) }
    }

    pub(crate) fn select<'a>(&self, list: &'a [String]) -> &'a str {
        debug_assert!(!list.is_empty(), "selection over an empty provider list");
        let idx = match self.strategy {
            Strategy::Random => rand::rng().random_range(0..list.len()),
            Strategy::RoundRobin => self.rr_index.fetch_add(1, Ordering::Relaxed) % list.len(),
            Strategy::HashLocal => {
                if LOCAL_HOST.is_empty() {
                    rand::rng().random_range(0..list.len())
                } else {
                    let mut h = DefaultHasher::new();
                    LOCAL_HOST.hash(&mut h);
                    (h.finish() as usize) % list.len()
                }
            }
        };
        &list[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> Vec<String> {
        vec!["a:1".into(), "b:2".into(), "c:3".into()]
    }

    #[test]
    fn round_robin_cycles() {
        let sel = RouteSelector::new(Strategy::RoundRobin);
        let list = providers();
        assert_eq!(sel.select(&list), "a:1");
        assert_eq!(sel.select(&list), "b:2");
        assert_eq!(sel.select(&list), "c:3");
        assert_eq!(sel.select(&list), "a:1");
    }

    #[test]
    fn random_stays_in_bounds() {
        let sel = RouteSelector::new(Strategy::Random);
        let list = providers();
        for _ in 0..50 {
            assert!(list.iter().any(|a| a == sel.select(&list)));
        }
    }

    #[test]
    fn hash_local_is_stable() {
        let sel = RouteSelector::new(Strategy::HashLocal);
        let list = providers();
        let first = sel.select(&list).to_owned();
        for _ in 0..10 {
            assert_eq!(sel.select(&list), first);
        }
    }
}
