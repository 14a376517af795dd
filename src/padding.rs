//! Traffic-shaping padding engine.
//!
//! A padding scheme maps a packet index (the session's flush counter) to a
//! deterministic list of target record-payload sizes. The session's write
//! path partitions each flush into records of those sizes, filling the
//! shortfall with `WASTE` frames, until the scheme's `stop` index is reached.
//!
//! Schemes are hot-swappable at runtime: the server advertises its scheme's
//! MD5, and pushes the raw scheme text to clients whose `padding-md5`
//! differs.

use crate::frame::StringMap;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use rand::Rng;
use std::io;
use std::sync::Arc;

/// Sentinel inside a size list: stop emitting padding for this packet if no
/// real payload remains, otherwise skip this entry.
pub const CHECK_MARK: i64 = -1;

/// The built-in scheme, identical to the reference implementation's.
pub const DEFAULT_PADDING_SCHEME: &str = r#"stop=8
0=30-30
1=100-400
2=400-500,c,500-1000,c,500-1000,c,500-1000,c,500-1000
3=9-9,500-1000
4=500-1000
5=500-1000
6=500-1000
7=500-1000"#;

/// An immutable, parsed padding scheme.
#[derive(Debug, Clone)]
pub struct PaddingFactory {
    scheme: StringMap,
    /// Raw scheme text, retransmittable as `UPDATE_PADDING_SCHEME`.
    raw_scheme: Vec<u8>,
    /// Packet index past which padding ceases.
    stop: u32,
    /// Lowercase hex MD5 of the raw scheme text.
    md5: String,
}

/// Lowercase hex MD5, the fingerprint format used in `padding-md5` and the
/// padding-update logs.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    let digest: [u8; 16] = hasher.finalize().into();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl PaddingFactory {
    pub fn new(raw_scheme: &[u8]) -> io::Result<Self> {
        let scheme = StringMap::from_bytes(raw_scheme);

        let stop = scheme
            .get("stop")
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "padding scheme missing 'stop'")
            })?
            .parse::<u32>()
            .map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid 'stop' in padding scheme")
            })?;

        let md5 = md5_hex(raw_scheme);

        Ok(Self {
            scheme,
            raw_scheme: raw_scheme.to_vec(),
            stop,
            md5,
        })
    }

    pub fn stop(&self) -> u32 {
        self.stop
    }

    pub fn md5(&self) -> &str {
        &self.md5
    }

    pub fn raw_scheme(&self) -> &[u8] {
        &self.raw_scheme
    }

    /// Target record-payload sizes for packet `pkt`.
    ///
    /// Entries are sampled uniformly from their `min-max` ranges; `c` maps
    /// to [`CHECK_MARK`]. Unknown or malformed entries are skipped. An empty
    /// result means "no padding for this packet".
    pub fn generate_record_payload_sizes(&self, pkt: u32) -> Vec<i64> {
        let Some(spec) = self.scheme.get(&pkt.to_string()) else {
            return Vec::new();
        };

        let mut sizes = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();

            if part == "c" {
                sizes.push(CHECK_MARK);
                continue;
            }

            if let Some((min_str, max_str)) = part.split_once('-') {
                let min_val: i64 = match min_str.trim().parse() {
                    Ok(v) if v > 0 => v,
                    _ => continue,
                };
                let max_val: i64 = match max_str.trim().parse() {
                    Ok(v) if v > 0 => v,
                    _ => continue,
                };
                let (min_val, max_val) = (min_val.min(max_val), min_val.max(max_val));

                if min_val == max_val {
                    sizes.push(min_val);
                } else {
                    sizes.push(rand::rng().random_range(min_val..=max_val));
                }
            }
        }

        sizes
    }
}

impl Default for PaddingFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PADDING_SCHEME.as_bytes())
            .expect("default padding scheme should be valid")
    }
}

/// The active padding scheme, shared across sessions and atomically
/// replaceable. Writers take a snapshot with [`PaddingCell::load`] at the
/// start of a flush and keep using it for the whole padding group.
#[derive(Debug)]
pub struct PaddingCell(RwLock<Arc<PaddingFactory>>);

impl PaddingCell {
    pub fn new(factory: PaddingFactory) -> Self {
        Self(RwLock::new(Arc::new(factory)))
    }

    /// Snapshot of the current scheme.
    pub fn load(&self) -> Arc<PaddingFactory> {
        self.0.read().clone()
    }

    /// Parse `raw` and install it as the current scheme. Returns false and
    /// keeps the old scheme when `raw` does not parse.
    pub fn update_from_raw(&self, raw: &[u8]) -> bool {
        match PaddingFactory::new(raw) {
            Ok(factory) => {
                *self.0.write() = Arc::new(factory);
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for PaddingCell {
    fn default() -> Self {
        Self::new(PaddingFactory::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scheme_parses() {
        let factory = PaddingFactory::default();
        assert_eq!(factory.stop(), 8);
        assert_eq!(factory.md5().len(), 32);
    }

    #[test]
    fn fixed_size_entry() {
        let factory = PaddingFactory::default();
        assert_eq!(factory.generate_record_payload_sizes(0), vec![30]);
    }

    #[test]
    fn random_range_entry() {
        let factory = PaddingFactory::default();
        for _ in 0..100 {
            let sizes = factory.generate_record_payload_sizes(1);
            assert_eq!(sizes.len(), 1);
            assert!((100..=400).contains(&sizes[0]));
        }
    }

    #[test]
    fn check_mark_entries() {
        let factory = PaddingFactory::new(b"stop=3\n2=400-500,c,500-1000").unwrap();
        let sizes = factory.generate_record_payload_sizes(2);
        assert_eq!(sizes.len(), 3);
        assert!((400..=500).contains(&sizes[0]));
        assert_eq!(sizes[1], CHECK_MARK);
        assert!((500..=1000).contains(&sizes[2]));
    }

    #[test]
    fn beyond_stop_is_empty() {
        let factory = PaddingFactory::default();
        assert!(factory.generate_record_payload_sizes(10).is_empty());
    }

    #[test]
    fn md5_is_deterministic() {
        let a = PaddingFactory::default();
        let b = PaddingFactory::new(DEFAULT_PADDING_SCHEME.as_bytes()).unwrap();
        assert_eq!(a.md5(), b.md5());
    }

    #[test]
    fn missing_stop_is_rejected() {
        assert!(PaddingFactory::new(b"0=100-100").is_err());
    }

    #[test]
    fn cell_swaps_atomically() {
        let cell = PaddingCell::default();
        let before = cell.load().md5().to_string();

        assert!(cell.update_from_raw(b"stop=2\n1=50-50"));
        let after = cell.load();
        assert_ne!(after.md5(), before);
        assert_eq!(after.stop(), 2);
        assert_eq!(after.generate_record_payload_sizes(1), vec![50]);
    }

    #[test]
    fn cell_keeps_old_scheme_on_bad_update() {
        let cell = PaddingCell::default();
        let before = cell.load().md5().to_string();
        assert!(!cell.update_from_raw(b"not a scheme"));
        assert_eq!(cell.load().md5(), before);
    }
}
