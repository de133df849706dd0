//! Retrieved capture data, split up by probe.

use std::io::Write;
use std::path::{ Path, PathBuf };

use crate::probe::ProbeKind;
use crate::scope::{ SampleDescription, Scope };
use crate::status::{ Error, Result };

/// Samples from a single probe: `sample_count` rows of `sample_width`
/// hit counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeData {
    pub sample_width: usize,
    pub sample_count: usize,
    pub data: Vec<u8>,
}
impl ProbeData {
    pub fn rows(&self) -> impl Iterator<Item=&[u8]> {
        self.data.chunks_exact(self.sample_width.max(1))
    }
}

/// Everything retrieved after a capture, one entry per attached probe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureData {
    probes: [Option<ProbeData>; 3],
}

impl CaptureData {
    /// Split whole samples laid out as in `desc` into per-probe matrices.
    /// Trailing bytes that don't form a whole sample are ignored.
    pub fn split(desc: &SampleDescription, raw: &[u8]) -> Self {
        let mut res = Self::default();
        if desc.total_size == 0 {
            return res;
        }
        let nsamples = raw.len() / desc.total_size;
        for kind in ProbeKind::ALL {
            let field = desc.field(kind);
            if field.size == 0 {
                continue;
            }
            let mut data = Vec::with_capacity(nsamples * field.size);
            for sample in raw.chunks_exact(desc.total_size) {
                data.extend_from_slice(&sample[field.range()]);
            }
            res.probes[kind.index()] = Some(ProbeData {
                sample_width: field.size,
                sample_count: nsamples,
                data,
            });
        }
        res
    }

    /// Drain every collected sample out of `scope`.
    pub fn retrieve(scope: &mut Scope) -> Result<Self> {
        let desc = scope.describe();
        let len = scope.sample_count() * desc.total_size;
        let mut raw = Vec::new();
        raw.try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory("capture data"))?;
        raw.resize(len, 0);
        let written = scope.retrieve(&mut raw);
        raw.truncate(written);
        Ok(Self::split(&desc, &raw))
    }

    pub fn get(&self, kind: ProbeKind) -> Option<&ProbeData> {
        self.probes[kind.index()].as_ref()
    }

    /// Number of samples (zero if no probe was attached).
    pub fn sample_count(&self) -> usize {
        self.probes.iter().flatten().map(|p| p.sample_count).next().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item=(ProbeKind, &ProbeData)> {
        ProbeKind::ALL.into_iter()
            .filter_map(|k| self.get(k).map(|d| (k, d)))
    }

    /// Hand every probe's data to `enc`.
    pub fn encode_with(&self, enc: &mut dyn SampleEncoder) -> std::io::Result<()> {
        for (kind, data) in self.iter() {
            enc.encode(kind, data)?;
        }
        Ok(())
    }
}

/// Turns per-probe capture data into some external representation.
pub trait SampleEncoder {
    fn encode(&mut self, kind: ProbeKind, data: &ProbeData) -> std::io::Result<()>;
}

/// Writes each probe's data, unchanged, to `<dir>/<kind>.bin`.
pub struct RawEncoder {
    dir: PathBuf,
    written: Vec<PathBuf>,
}
impl RawEncoder {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), written: Vec::new() }
    }

    /// Files written so far.
    pub fn written(&self) -> &[PathBuf] { &self.written }
}
impl SampleEncoder for RawEncoder {
    fn encode(&mut self, kind: ProbeKind, data: &ProbeData) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.bin", kind));
        let mut f = std::fs::File::create(&path)?;
        f.write_all(&data.data)?;
        log::debug!("wrote {} samples x {} bytes to {}",
            data.sample_count, data.sample_width, path.display());
        self.written.push(path);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scope::Field;

    fn desc() -> SampleDescription {
        SampleDescription {
            total_size: 5,
            l1d: Field { offs: 0, size: 2 },
            l1i: Field::default(),
            btb: Field { offs: 2, size: 3 },
        }
    }

    #[test]
    fn split_by_probe() {
        let raw = [1, 2, 10, 11, 12, 3, 4, 13, 14, 15, 99];
        let data = CaptureData::split(&desc(), &raw);
        assert_eq!(data.sample_count(), 2);
        assert!(data.get(ProbeKind::L1i).is_none());
        let l1d = data.get(ProbeKind::L1d).unwrap();
        assert_eq!(l1d.data, vec![1, 2, 3, 4]);
        assert_eq!(l1d.rows().collect::<Vec<_>>(), vec![&[1, 2][..], &[3, 4][..]]);
        let btb = data.get(ProbeKind::Btb).unwrap();
        assert_eq!((btb.sample_width, btb.sample_count), (3, 2));
        assert_eq!(btb.data, vec![10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn nothing_attached() {
        let data = CaptureData::split(&SampleDescription::default(), &[1, 2, 3]);
        assert_eq!(data, CaptureData::default());
        assert_eq!(data.sample_count(), 0);
        assert_eq!(data.iter().count(), 0);
    }

    #[test]
    fn raw_files() {
        let dir = tempfile::tempdir().unwrap();
        let raw = [1, 2, 10, 11, 12];
        let data = CaptureData::split(&desc(), &raw);
        let mut enc = RawEncoder::new(dir.path().join("out"));
        data.encode_with(&mut enc).unwrap();
        assert_eq!(enc.written().len(), 2);
        let l1d = std::fs::read(dir.path().join("out").join("l1d.bin")).unwrap();
        assert_eq!(l1d, vec![1, 2]);
        let btb = std::fs::read(dir.path().join("out").join("btb.bin")).unwrap();
        assert_eq!(btb, vec![10, 11, 12]);
    }
}
