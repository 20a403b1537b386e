//! Upstream selection policies.
//!
//! Every selector works on a list of candidate indices into the pool's
//! upstream slice. The list is already filtered to the upstreams that should
//! be considered and is in insertion order, which is the tie-break order for
//! all policies: on equal score the lowest insertion index wins.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::upstream::Upstream;
use crate::UpstreamError;

/// Scheduling discipline used by [`UpstreamPool::select`].
///
/// [`UpstreamPool::select`]: crate::UpstreamPool::select
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rotation {
    /// Smooth weighted round robin.
    #[default]
    RoundRobin,
    /// Always the heaviest alive upstream; the next heaviest on failure.
    MasterSlave,
    /// Weighted random draw.
    Random,
    /// Rendezvous (highest random weight) hashing on a caller-supplied key.
    Hashed,
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RoundRobin => "round-robin",
            Self::MasterSlave => "master-slave",
            Self::Random => "random",
            Self::Hashed => "hashed",
        })
    }
}

impl FromStr for Rotation {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Self::RoundRobin),
            "master-slave" => Ok(Self::MasterSlave),
            "random" => Ok(Self::Random),
            "hashed" | "hash" => Ok(Self::Hashed),
            other => Err(UpstreamError::Config(format!("unknown rotation: {other}"))),
        }
    }
}

/// Picks one of `candidates` according to `rotation`.
///
/// Returns `None` only when `candidates` is empty. A hashed rotation without
/// a key degrades to a weighted random draw.
pub fn select(
    rotation: Rotation,
    upstreams: &mut [Upstream],
    candidates: &[usize],
    key: Option<&[u8]>,
) -> Option<usize> {
    match (rotation, key) {
        (Rotation::RoundRobin, _) => round_robin(upstreams, candidates),
        (Rotation::MasterSlave, _) => master_slave(upstreams, candidates),
        (Rotation::Random, _) | (Rotation::Hashed, None) => {
            weighted_random(upstreams, candidates, &mut rand::thread_rng())
        }
        (Rotation::Hashed, Some(key)) => rendezvous(upstreams, candidates, key),
    }
}

/// Smooth weighted round robin.
///
/// Each call credits every candidate with its weight, picks the candidate
/// holding the most credit and charges it the total weight. Starting from
/// zero credit, every run of `Σweight` calls selects each candidate exactly
/// `weight` times, interleaved rather than in bursts.
pub fn round_robin(upstreams: &mut [Upstream], candidates: &[usize]) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    let mut total = 0i64;

    for &idx in candidates {
        let upstream = &mut upstreams[idx];
        let weight = i64::from(upstream.weight());
        upstream.credit += weight;
        total += weight;

        let credit = upstream.credit;
        if best.map_or(true, |(_, top)| credit > top) {
            best = Some((idx, credit));
        }
    }

    let (chosen, _) = best?;
    upstreams[chosen].credit -= total;
    Some(chosen)
}

/// Highest weight wins; equal weights go to the earliest upstream.
pub fn master_slave(upstreams: &[Upstream], candidates: &[usize]) -> Option<usize> {
    candidates.iter().copied().fold(None, |best, idx| match best {
        Some(b) if upstreams[b].weight() >= upstreams[idx].weight() => Some(b),
        _ => Some(idx),
    })
}

/// Draws uniformly from `[0, Σweight)` and returns the candidate whose
/// cumulative weight interval contains the draw.
pub fn weighted_random<R: Rng + ?Sized>(
    upstreams: &[Upstream],
    candidates: &[usize],
    rng: &mut R,
) -> Option<usize> {
    let total: u64 = candidates
        .iter()
        .map(|&idx| u64::from(upstreams[idx].weight()))
        .sum();
    if total == 0 {
        return candidates.first().copied();
    }

    let mut remaining = rng.gen_range(0..total);
    for &idx in candidates {
        let weight = u64::from(upstreams[idx].weight());
        if remaining < weight {
            return Some(idx);
        }
        remaining -= weight;
    }

    candidates.last().copied()
}

/// Rendezvous hashing: the candidate with the highest
/// [`rendezvous_score`] for `key` wins.
///
/// Adding or removing one upstream only moves the keys that upstream wins
/// or held, so roughly `1/(N+1)` of keys change owner when growing a pool of
/// `N` to `N+1`.
pub fn rendezvous(upstreams: &[Upstream], candidates: &[usize], key: &[u8]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;

    for &idx in candidates {
        let upstream = &upstreams[idx];
        let score = rendezvous_score(upstream.name(), upstream.port(), key);
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((idx, score));
        }
    }

    best.map(|(idx, _)| idx)
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(seed, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

/// MurmurHash3 64-bit finalizer.
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Score of one upstream for one key.
///
/// FNV-1a over the upstream's name and big-endian port, mixed with the
/// finalized FNV-1a hash of the key. The function is fixed, so a key maps to
/// the same upstream across processes, hosts and compiler versions.
pub fn rendezvous_score(name: &str, port: u16, key: &[u8]) -> u64 {
    let node = fnv1a(fnv1a(FNV_OFFSET, name.as_bytes()), &port.to_be_bytes());
    fmix64(node ^ fmix64(fnv1a(FNV_OFFSET, key)))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::UpstreamLimits;

    fn upstreams(specs: &[(&str, u32)]) -> Vec<Upstream> {
        let now = Instant::now();
        specs
            .iter()
            .enumerate()
            .map(|(idx, (name, weight))| {
                Upstream::new(name, 443, *weight, idx, UpstreamLimits::default(), now)
            })
            .collect()
    }

    fn all(upstreams: &[Upstream]) -> Vec<usize> {
        (0..upstreams.len()).collect()
    }

    #[test]
    fn empty_candidates_select_nothing() {
        let mut ups = upstreams(&[("a", 1)]);
        for rotation in [
            Rotation::RoundRobin,
            Rotation::MasterSlave,
            Rotation::Random,
            Rotation::Hashed,
        ] {
            assert_eq!(select(rotation, &mut ups, &[], Some(&b"key"[..])), None);
        }
    }

    #[test]
    fn round_robin_interleaves_by_weight() {
        let mut ups = upstreams(&[("microsoft", 1), ("google", 2), ("kernel", 3)]);
        let candidates = all(&ups);

        let picks = (0..6)
            .map(|_| round_robin(&mut ups, &candidates).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(picks, vec![2, 1, 0, 2, 1, 2]);
        assert!(ups.iter().all(|u| u.credit == 0));
    }

    #[test]
    fn round_robin_equal_weights_alternate() {
        let mut ups = upstreams(&[("a", 1), ("b", 1)]);
        let candidates = all(&ups);

        let picks = (0..4)
            .map(|_| round_robin(&mut ups, &candidates).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn round_robin_over_subset_ignores_others() {
        let mut ups = upstreams(&[("a", 5), ("b", 1), ("c", 1)]);
        let candidates = vec![1, 2];

        for _ in 0..10 {
            assert_ne!(round_robin(&mut ups, &candidates), Some(0));
        }
        assert_eq!(ups[0].credit, 0);
    }

    #[test]
    fn master_slave_prefers_heaviest_then_earliest() {
        let ups = upstreams(&[("a", 2), ("b", 3), ("c", 3)]);
        assert_eq!(master_slave(&ups, &all(&ups)), Some(1));
        assert_eq!(master_slave(&ups, &[0, 2]), Some(2));
        assert_eq!(master_slave(&ups, &[0]), Some(0));
    }

    #[test]
    fn weighted_random_converges_to_weights() {
        let ups = upstreams(&[("a", 1), ("b", 3)]);
        let candidates = all(&ups);
        let mut rng = StdRng::seed_from_u64(7);

        let draws = 40_000;
        let b_hits = (0..draws)
            .filter(|_| weighted_random(&ups, &candidates, &mut rng) == Some(1))
            .count();

        let ratio = b_hits as f64 / draws as f64;
        assert!((ratio - 0.75).abs() < 0.02, "ratio {ratio}");
    }

    #[test]
    fn rendezvous_is_deterministic_per_key() {
        let ups = upstreams(&[("a", 1), ("b", 1), ("c", 1)]);
        let candidates = all(&ups);

        let first = rendezvous(&ups, &candidates, b"some key");
        for _ in 0..10 {
            assert_eq!(rendezvous(&ups, &candidates, b"some key"), first);
        }
    }

    #[test]
    fn rendezvous_only_moves_keys_of_removed_upstream() {
        let ups = upstreams(&[("a", 1), ("b", 1), ("c", 1)]);
        let full = all(&ups);
        let without_b = vec![0, 2];

        for i in 0u32..2_000 {
            let key = i.to_le_bytes();
            let before = rendezvous(&ups, &full, &key).unwrap();
            let after = rendezvous(&ups, &without_b, &key).unwrap();
            if before != 1 {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn rendezvous_score_is_fixed() {
        assert_eq!(
            rendezvous_score("kernel.org", 443, b"message-id"),
            0x9970_ae86_be06_2d61
        );
        assert_eq!(rendezvous_score("google.com", 80, b""), 0x2757_c51b_dea9_67db);
        assert_ne!(
            rendezvous_score("google.com", 80, b"k"),
            rendezvous_score("google.com", 81, b"k")
        );
    }

    #[test]
    fn rotation_parses_from_config_names() {
        assert_eq!("round-robin".parse::<Rotation>().unwrap(), Rotation::RoundRobin);
        assert_eq!("master_slave".parse::<Rotation>().unwrap(), Rotation::MasterSlave);
        assert_eq!("Hashed".parse::<Rotation>().unwrap(), Rotation::Hashed);
        assert!("sticky".parse::<Rotation>().is_err());
        assert_eq!(Rotation::Random.to_string(), "random");
    }
}
