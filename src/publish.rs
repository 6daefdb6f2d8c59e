//! Result publication by the designated unit
//!
//! After the last phase, core 0 / thread 0 applies the kernel's final reshape,
//! flushes the whole result to external memory and writes the element count
//! into the completion register. Publication is idempotent: the reshape runs
//! on the first call only, later calls re-flush identical data.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::backend::{Intrinsics, UnitContext};
pub use crate::backend::COMPLETION_SLOT;
use crate::error::{ForgeResult, NpuForgeError};
use crate::memory::{Element, SharedBuffer};

/// In-place transformation of the result applied before the first flush
pub type Reshape<T> = Box<dyn Fn(&SharedBuffer<T>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub elements: usize,
    pub lines_flushed: usize,
    pub first_publication: bool,
}

pub struct ResultPublisher<T: Element> {
    element_count: usize,
    reshape: Option<Reshape<T>>,
    published: AtomicBool,
}

impl<T: Element> ResultPublisher<T> {
    pub fn new(element_count: usize) -> Self {
        ResultPublisher {
            element_count,
            reshape: None,
            published: AtomicBool::new(false),
        }
    }

    pub fn with_reshape(mut self, reshape: impl Fn(&SharedBuffer<T>) + Send + Sync + 'static) -> Self {
        self.reshape = Some(Box::new(reshape));
        self
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Arm the reshape again for the next run
    pub fn reset(&self) {
        self.published.store(false, Ordering::Release);
    }

    pub fn publish(
        &self,
        ctx: &mut UnitContext<'_>,
        buffer: &SharedBuffer<T>,
    ) -> ForgeResult<PublishReport> {
        if !ctx.is_designated() {
            return Err(NpuForgeError::NotDesignatedUnit {
                core: ctx.core_id(),
                thread: ctx.thread_id(),
            });
        }

        let first_publication = !self.published.swap(true, Ordering::AcqRel);
        if first_publication {
            if let Some(reshape) = &self.reshape {
                reshape(buffer);
            }
        }

        let lines_flushed = ctx.flush_all(buffer)?;
        let count = u32::try_from(self.element_count).map_err(|_| {
            NpuForgeError::InvalidProblemSize(format!(
                "{} elements do not fit the completion register",
                self.element_count
            ))
        })?;
        ctx.write_completion(count, COMPLETION_SLOT)?;

        tracing::debug!(
            elements = self.element_count,
            lines = lines_flushed,
            first_publication,
            "result published"
        );
        Ok(PublishReport {
            elements: self.element_count,
            lines_flushed,
            first_publication,
        })
    }
}

impl<T: Element> std::fmt::Debug for ResultPublisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultPublisher")
            .field("element_count", &self.element_count)
            .field("has_reshape", &self.reshape.is_some())
            .field("published", &self.is_published())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sequential::ReferenceDevice;
    use crate::backend::Device;
    use crate::grid::{ExecutionUnit, Grid};
    use crate::staging::Scratchpad;
    use crate::sync::PhasePlan;

    fn plan() -> PhasePlan {
        PhasePlan::builder().phase("compute", 1).build().unwrap()
    }

    #[test]
    fn test_publish_twice_is_identical() {
        let device = ReferenceDevice::new(Grid::new(1, 2).unwrap());
        let plan = plan();
        let mut ctx = UnitContext::new(ExecutionUnit::DESIGNATED, &device, &plan, Scratchpad::new(64));

        let buffer = SharedBuffer::from_slice(&[1, 2, 3, 4]);
        buffer.write_range(0, &[5, 6, 7, 8]);
        let publisher = ResultPublisher::new(4).with_reshape(|b: &SharedBuffer<i32>| {
            let reversed: Vec<i32> = b.snapshot().into_iter().rev().collect();
            b.write_range(0, &reversed);
        });

        let first = publisher.publish(&mut ctx, &buffer).unwrap();
        let after_first = buffer.committed();
        let second = publisher.publish(&mut ctx, &buffer).unwrap();

        assert!(first.first_publication);
        assert!(!second.first_publication);
        assert_eq!(after_first, vec![8, 7, 6, 5]);
        assert_eq!(buffer.committed(), after_first);
        assert_eq!(device.registers().read(COMPLETION_SLOT).unwrap(), 4);
        assert_eq!(device.flushed_lines(), 2);
    }

    #[test]
    fn test_reset_reapplies_reshape() {
        let device = ReferenceDevice::new(Grid::new(1, 1).unwrap());
        let plan = plan();
        let mut ctx = UnitContext::new(ExecutionUnit::DESIGNATED, &device, &plan, Scratchpad::new(64));
        let buffer = SharedBuffer::from_slice(&[1, 2]);
        let publisher = ResultPublisher::new(2).with_reshape(|b: &SharedBuffer<i32>| b.update(0, |v| v + 100));

        publisher.publish(&mut ctx, &buffer).unwrap();
        buffer.reset_from(&[1, 2]);
        publisher.reset();
        assert!(!publisher.is_published());

        let report = publisher.publish(&mut ctx, &buffer).unwrap();
        assert!(report.first_publication);
        assert_eq!(buffer.committed(), vec![101, 2]);
    }

    #[test]
    fn test_only_designated_unit_publishes() {
        let device = ReferenceDevice::new(Grid::new(1, 2).unwrap());
        let plan = plan();
        let mut ctx = UnitContext::new(ExecutionUnit::new(0, 1), &device, &plan, Scratchpad::new(64));
        let buffer = SharedBuffer::<f32>::zeroed(4);

        let err = ResultPublisher::new(4).publish(&mut ctx, &buffer).unwrap_err();
        assert!(matches!(
            err,
            NpuForgeError::NotDesignatedUnit { core: 0, thread: 1 }
        ));
        assert_eq!(device.registers().read(COMPLETION_SLOT).unwrap(), 0);
    }
}
