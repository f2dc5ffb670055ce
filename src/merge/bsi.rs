use crate::core::error::Result;
use crate::index::bsi::Bsi;
use crate::merge::ValueMerger;

/// Unions bit-sliced index operands. Direction does not matter.
pub struct BsiMerger {
    operands: Vec<Bsi>,
}

impl BsiMerger {
    pub fn new(value: &[u8]) -> Result<Self> {
        Ok(BsiMerger { operands: vec![Bsi::deserialize(value)?] })
    }
}

impl ValueMerger for BsiMerger {
    fn merge_newer(&mut self, value: &[u8]) -> Result<()> {
        self.operands.push(Bsi::deserialize(value)?);
        Ok(())
    }

    fn merge_older(&mut self, value: &[u8]) -> Result<()> {
        self.merge_newer(value)
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        match self.operands.as_slice() {
            [single] => single.serialize(),
            operands => Bsi::par_union(operands).serialize(),
        }
    }
}
