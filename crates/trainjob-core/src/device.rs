//! Accelerator detection from container resource limits.

use crate::constants;
use crate::error::{Result, TrainerError};
use crate::types::{DeviceCount, DeviceKind};
use std::collections::BTreeMap;
use trainjob_abstraction::{Quantity, ResourceRequirements};

/// Resource families in priority order. The first key present wins.
const DEVICE_LABELS: [(&str, DeviceKind); 3] = [
    (constants::GPU_LABEL, DeviceKind::Gpu),
    (constants::TPU_LABEL, DeviceKind::Tpu),
    (constants::CPU_LABEL, DeviceKind::Cpu),
];

/// Resolves the device family and count from resource limits.
///
/// Absent limits, or limits naming none of the recognized families, resolve to
/// an unknown pair. A recognized key whose value is not a count is an error.
pub fn resolve_devices(
    limits: Option<&BTreeMap<String, Quantity>>,
) -> Result<(DeviceKind, DeviceCount)> {
    let Some(limits) = limits else {
        return Ok((DeviceKind::Unknown, DeviceCount::Unknown));
    };

    for (label, kind) in DEVICE_LABELS {
        if let Some(quantity) = limits.get(label) {
            let count = parse_quantity(quantity).ok_or_else(|| {
                TrainerError::InvalidResourceQuantity {
                    key: label.to_string(),
                    value: quantity.to_string(),
                }
            })?;
            return Ok((kind, DeviceCount::Count(count)));
        }
    }

    Ok((DeviceKind::Unknown, DeviceCount::Unknown))
}

/// Resolves devices for an optional container resource block.
pub fn resolve_container_devices(
    resources: Option<&ResourceRequirements>,
) -> Result<(DeviceKind, DeviceCount)> {
    resolve_devices(resources.and_then(|r| r.limits.as_ref()))
}

/// Parses a count quantity: integers, decimals and millis (`500m`).
fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let value = match quantity {
        #[allow(clippy::cast_precision_loss)]
        Quantity::Int(value) => *value as f64,
        Quantity::Float(value) => *value,
        Quantity::Str(raw) => {
            let raw = raw.trim();
            match raw.strip_suffix('m') {
                Some(millis) => millis.parse::<f64>().ok()? / 1000.0,
                None => raw.parse::<f64>().ok()?,
            }
        }
    };

    (value.is_finite() && value >= 0.0).then_some(value)
}
