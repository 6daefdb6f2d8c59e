//! Result publication: designated unit only, idempotent

mod common;

use common::{grid, run_parallel, run_reference};
use npuforge::backend::sequential::ReferenceDevice;
use npuforge::backend::{UnitContext, COMPLETION_SLOT};
use npuforge::grid::ExecutionUnit;
use npuforge::kernels::{KernelKind, PhasedKernel};
use npuforge::staging::Scratchpad;
use npuforge::NpuForgeError;

fn publish_again(kernel: &dyn PhasedKernel, unit: ExecutionUnit) -> Result<npuforge::publish::PublishReport, NpuForgeError> {
    let device = ReferenceDevice::new(kernel.grid());
    let mut ctx = UnitContext::new(unit, &device, kernel.plan(), Scratchpad::new(1024));
    let report = kernel.publish(&mut ctx)?;
    assert_eq!(
        ctx.registers().read(COMPLETION_SLOT).unwrap() as usize,
        report.elements
    );
    Ok(report)
}

#[test]
fn test_publishing_twice_produces_same_output() {
    for kind in [KernelKind::Matmul, KernelKind::Conv, KernelKind::Lud, KernelKind::Crc] {
        let kernel = kind.build(grid(2, 2)).unwrap();
        run_parallel(kernel.as_ref());
        let first = kernel.output();

        let report = publish_again(kernel.as_ref(), ExecutionUnit::DESIGNATED).unwrap();
        assert!(!report.first_publication, "{} reshaped twice", kind);
        assert_eq!(report.elements, first.len());
        assert_eq!(kernel.output(), first, "{} changed on republication", kind);
    }
}

#[test]
fn test_only_designated_unit_publishes() {
    let kernel = KernelKind::Transpose.build(grid(2, 2)).unwrap();
    run_reference(kernel.as_ref());

    let err = publish_again(kernel.as_ref(), ExecutionUnit::new(1, 0)).unwrap_err();
    assert!(matches!(err, NpuForgeError::NotDesignatedUnit { core: 1, thread: 0 }));
    assert!(err.is_synchronization_error());
}

#[test]
fn test_output_invisible_before_publication() {
    let kernel = KernelKind::Fir.build(grid(1, 2)).unwrap();
    assert!(kernel.output().to_strings().iter().all(|v| v == "0"));
    run_reference(kernel.as_ref());
    assert!(kernel.output().to_strings().iter().any(|v| v != "0"));
}
