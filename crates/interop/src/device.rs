//! Platform and device selection.
//!
//! Platform policy: the first platform whose vendor string contains the
//! preferred vendor (case-sensitive substring), otherwise the first platform
//! enumerated. Device policy: the first GPU-class device on that platform
//! which, when interop is required, reports the platform's interop token.

use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, DeviceClass, DeviceInfo, PlatformInfo};
use crate::error::InitError;

/// Pick a platform, preferring one whose vendor contains `preferred_vendor`.
pub fn select_platform<B: ComputeBackend>(
    backend: &mut B,
    preferred_vendor: Option<&str>,
) -> Result<PlatformInfo, InitError> {
    let platforms = backend.platforms().map_err(InitError::PlatformQueryFailed)?;
    if platforms.is_empty() {
        return Err(InitError::NoPlatformFound);
    }

    for p in &platforms {
        debug!(platform = %p.name, vendor = %p.vendor, version = %p.version, "found platform");
    }

    let preferred = preferred_vendor
        .filter(|v| !v.is_empty())
        .and_then(|v| platforms.iter().position(|p| p.vendor.contains(v)));

    let index = match (preferred_vendor, preferred) {
        (_, Some(i)) => i,
        (Some(v), None) if !v.is_empty() => {
            warn!(preferred = v, "no platform from preferred vendor, using first platform");
            0
        }
        _ => 0,
    };

    let chosen = platforms[index].clone();
    info!(platform = %chosen.name, vendor = %chosen.vendor, "selected platform");
    Ok(chosen)
}

/// Pick the first GPU on `platform`, requiring the interop token if asked.
pub fn select_device<B: ComputeBackend>(
    backend: &mut B,
    platform: &PlatformInfo,
    require_interop: bool,
) -> Result<DeviceInfo, InitError> {
    let devices = match backend.devices(platform.id) {
        Ok(d) => d,
        Err(status) => {
            return Err(InitError::NoDeviceFound {
                platform: platform.name.clone(),
                reason: format!("device query failed: {status}"),
            })
        }
    };

    for d in &devices {
        debug!("{}", describe_device(d));
    }

    let gpus: Vec<&DeviceInfo> = devices.iter().filter(|d| d.class == DeviceClass::Gpu).collect();
    if gpus.is_empty() {
        return Err(InitError::NoDeviceFound {
            platform: platform.name.clone(),
            reason: format!("no GPU device among {} enumerated", devices.len()),
        });
    }

    let chosen = if require_interop {
        gpus.into_iter()
            .find(|d| d.supports(&platform.interop_extension))
            .ok_or_else(|| InitError::NoDeviceFound {
                platform: platform.name.clone(),
                reason: format!("no GPU reports `{}`", platform.interop_extension),
            })?
    } else {
        gpus[0]
    };

    info!(device = %chosen.name, vendor = %chosen.vendor, interop = require_interop, "selected device");
    Ok(chosen.clone())
}

/// One-line capability summary for diagnostics.
pub fn describe_device(device: &DeviceInfo) -> String {
    format!(
        "{} [{}] vendor={} driver={} max_work_group_size={} extensions={}",
        device.name,
        device.class,
        device.vendor,
        device.driver,
        device.max_work_group_size,
        device.extensions.join(" "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuBackend, CpuDeviceSpec, CpuPlatformSpec};

    fn backend(platforms: Vec<CpuPlatformSpec>) -> CpuBackend {
        CpuBackend::with_platforms(platforms)
    }

    fn gpu(name: &str, interop: bool) -> CpuDeviceSpec {
        CpuDeviceSpec::gpu(name, interop)
    }

    #[test]
    fn test_prefers_vendor_substring() {
        let mut b = backend(vec![
            CpuPlatformSpec::new("Portable", "Mesa", vec![gpu("a", true)]),
            CpuPlatformSpec::new("CUDA", "NVIDIA Corporation", vec![gpu("b", true)]),
        ]);
        let p = select_platform(&mut b, Some("NVIDIA")).unwrap();
        assert_eq!(p.name, "CUDA");
    }

    #[test]
    fn test_vendor_match_is_case_sensitive() {
        let mut b = backend(vec![
            CpuPlatformSpec::new("First", "Mesa", vec![]),
            CpuPlatformSpec::new("Second", "nvidia", vec![]),
        ]);
        let p = select_platform(&mut b, Some("NVIDIA")).unwrap();
        assert_eq!(p.name, "First");
    }

    #[test]
    fn test_no_platforms() {
        let mut b = backend(vec![]);
        assert_eq!(select_platform(&mut b, None), Err(InitError::NoPlatformFound));
    }

    #[test]
    fn test_device_requires_interop_token() {
        let mut b = backend(vec![CpuPlatformSpec::new(
            "P",
            "V",
            vec![gpu("plain", false), gpu("shared", true)],
        )]);
        let p = select_platform(&mut b, None).unwrap();
        assert_eq!(select_device(&mut b, &p, true).unwrap().name, "shared");
        assert_eq!(select_device(&mut b, &p, false).unwrap().name, "plain");
    }

    #[test]
    fn test_no_interop_device_fails() {
        let mut b = backend(vec![CpuPlatformSpec::new("P", "V", vec![gpu("plain", false)])]);
        let p = select_platform(&mut b, None).unwrap();
        assert!(matches!(
            select_device(&mut b, &p, true),
            Err(InitError::NoDeviceFound { .. })
        ));
    }

    #[test]
    fn test_cpu_class_devices_skipped() {
        let mut b = backend(vec![CpuPlatformSpec::new(
            "P",
            "V",
            vec![CpuDeviceSpec::cpu("host"), gpu("card", true)],
        )]);
        let p = select_platform(&mut b, None).unwrap();
        assert_eq!(select_device(&mut b, &p, true).unwrap().name, "card");
    }
}
