//! Sample records.

use crate::status::{ Error, Result };

/// One record: a hit-count byte per active set of every activated probe.
#[derive(Clone, Debug)]
pub struct Sample {
    /// Set by the collector when the trigger line was raised.
    pub collected: bool,
    pub data: Vec<u8>,
}
impl Sample {
    pub fn new(size: usize) -> Self {
        Self { collected: false, data: vec![0; size] }
    }

    /// Like [`Sample::new`], but fails instead of aborting when memory is
    /// exhausted. Every page of the record is written before returning.
    pub fn try_new(size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory("sample"))?;
        data.resize(size, 0);
        Ok(Self { collected: false, data })
    }

    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
}

/// Placement of one probe's data inside a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Field {
    pub offs: usize,
    pub size: usize,
}
impl Field {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offs..self.offs + self.size
    }
}

/// Layout of a sample. Probes that aren't attached have an empty field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleDescription {
    pub total_size: usize,
    pub l1d: Field,
    pub l1i: Field,
    pub btb: Field,
}
impl SampleDescription {
    pub fn field(&self, kind: crate::probe::ProbeKind) -> &Field {
        use crate::probe::ProbeKind;
        match kind {
            ProbeKind::L1d => &self.l1d,
            ProbeKind::L1i => &self.l1i,
            ProbeKind::Btb => &self.btb,
        }
    }

    pub fn field_mut(&mut self, kind: crate::probe::ProbeKind) -> &mut Field {
        use crate::probe::ProbeKind;
        match kind {
            ProbeKind::L1d => &mut self.l1d,
            ProbeKind::L1i => &mut self.l1i,
            ProbeKind::Btb => &mut self.btb,
        }
    }
}
