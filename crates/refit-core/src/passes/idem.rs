//! The identity pass.

use crate::callgraph::UnitKind;
use crate::error::TransformError;
use crate::scheduler::{Pass, PassContext, PassOutput};

/// Leaves every unit untouched. Running it and regenerating must reproduce
/// the input byte for byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct Idem;

impl Pass for Idem {
    fn name(&self) -> &str {
        "idem"
    }

    fn unit_kinds(&self) -> &[UnitKind] {
        UnitKind::ALL
    }

    fn run(&self, _cx: &mut PassContext<'_>) -> Result<PassOutput, TransformError> {
        Ok(PassOutput::unchanged())
    }
}
