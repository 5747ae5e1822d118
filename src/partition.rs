//! # Sub-instrument partitions
//!
//! A [`SubInstrumentPartition`] is the ordered set of observations of one instrument whose epochs
//! fall inside one time division (see [`crate::instruments`]). Masks and templates are built per
//! partition, and partitions never share mutable state, so they can be processed in parallel.
//!
//! ## Mask lifecycle
//! -----------------
//! The dataset-level [`PixelMask`] of a partition is stored in a write-once cell. It is attached by
//! [`SubInstrumentPartition::attach_mask`] once mask construction has finished, and from then on
//! every frame loaded through [`SubInstrumentPartition::load_frame`] carries it. A second attach
//! is refused: the mask is immutable until the partition is rebuilt from the dataset.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::constants::{FrameId, SubInstrumentId};
use crate::dataset::Dataset;
use crate::frame::{Frame, FrameDescriptor};
use crate::mask::PixelMask;
use crate::specstack_errors::SpecStackError;

/// `(instrument, sub-instrument)` pair identifying a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub instrument: String,
    pub sub_instrument: SubInstrumentId,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instrument, self.sub_instrument)
    }
}

#[derive(Debug)]
pub struct SubInstrumentPartition {
    key: PartitionKey,
    members: Vec<FrameDescriptor>,
    mask: OnceCell<Arc<PixelMask>>,
}

impl SubInstrumentPartition {
    /// Members are kept in the order given, which is the dataset order.
    pub fn new(key: PartitionKey, members: Vec<FrameDescriptor>) -> Self {
        SubInstrumentPartition {
            key,
            members,
            mask: OnceCell::new(),
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn sub_instrument(&self) -> &SubInstrumentId {
        &self.key.sub_instrument
    }

    /// Every member, valid or not.
    pub fn members(&self) -> &[FrameDescriptor] {
        &self.members
    }

    /// Members that passed the upstream quality filters, in partition order.
    pub fn valid_frames(&self) -> impl Iterator<Item = &FrameDescriptor> {
        self.members.iter().filter(|d| d.is_valid)
    }

    pub fn n_valid(&self) -> usize {
        self.valid_frames().count()
    }

    pub fn contains(&self, id: FrameId) -> bool {
        self.members.iter().any(|d| d.id == id)
    }

    /// Freeze the dataset-level mask of this partition.
    ///
    /// Return
    /// ----------
    /// * `Ok(())` the first time; [`SpecStackError::InvalidParameter`] if a mask is already attached.
    pub fn attach_mask(&self, mask: PixelMask) -> Result<(), SpecStackError> {
        self.mask.set(Arc::new(mask)).map_err(|_| {
            SpecStackError::InvalidParameter(format!("{} already has a frozen pixel mask", self.key))
        })
    }

    pub fn mask(&self) -> Option<&Arc<PixelMask>> {
        self.mask.get()
    }

    /// Load a member frame with the partition mask (if any) merged into it.
    ///
    /// The raw arrays come from the dataset's lazy cache; when a mask is attached the returned
    /// frame is a masked copy owned by the caller and released with it.
    pub fn load_frame(&self, dataset: &Dataset, id: FrameId) -> Result<Arc<Frame>, SpecStackError> {
        if !self.contains(id) {
            return Err(SpecStackError::FrameNotFound(id));
        }
        let raw = dataset.load_frame(id)?;
        match self.mask.get() {
            None => Ok(raw),
            Some(mask) => {
                let mut masked = (*raw).clone();
                masked.apply_mask(mask.flags())?;
                Ok(Arc::new(masked))
            }
        }
    }
}
