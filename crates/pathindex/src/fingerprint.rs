//! Path-set fingerprinting.
//!
//! The fingerprint only covers which paths exist, not their contents or
//! modification times: a file edited in place keeps the same fingerprint.

use std::fmt;
use std::hash::Hasher;
use std::path::Path;
use std::str::FromStr;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// FNV-1a hash over a sorted path set.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16).map(Self)
    }
}

/// Fingerprints a set of paths independent of enumeration order.
pub fn fingerprint<'a, I>(paths: I) -> Fingerprint
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut sorted: Vec<&Path> = paths.into_iter().collect();
    sorted.sort_unstable();

    let mut hasher = FnvHasher::default();
    for path in sorted {
        hasher.write(path.to_string_lossy().as_bytes());
        hasher.write(&[0xff]);
    }
    Fingerprint(hasher.finish())
}
