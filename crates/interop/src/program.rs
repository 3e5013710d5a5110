//! WGSL program reflection.
//!
//! Kernels are WGSL compute entry points. Their arguments are the
//! `@group(0)` resource bindings the entry point actually uses; the binding
//! number is the argument slot. Storage bindings are buffer arguments,
//! uniform bindings of a single scalar are by-value arguments, any other
//! uniform binding is a read-only buffer argument.
//!
//! Both backends use [`reflect_wgsl`] as their compiler front end, so a
//! syntax or validation error produces the same build log on either.

use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, ScalarKind, ShaderStage, StorageAccess, TypeInner};

use crate::backend::ScalarType;

/// How a kernel argument slot must be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Buffer { writable: bool },
    Scalar(ScalarType),
}

/// One declared kernel argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSlot {
    pub slot: u32,
    pub name: Option<String>,
    pub kind: ArgKind,
}

/// A compute entry point and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointInfo {
    pub name: String,
    pub workgroup_size: [u32; 3],
    /// Sorted by slot.
    pub args: Vec<ArgSlot>,
}

impl EntryPointInfo {
    pub fn arg(&self, slot: u32) -> Option<&ArgSlot> {
        self.args.iter().find(|a| a.slot == slot)
    }
}

/// Reflection data for a built program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramInfo {
    pub entry_points: Vec<EntryPointInfo>,
}

impl ProgramInfo {
    pub fn entry_point(&self, name: &str) -> Option<&EntryPointInfo> {
        self.entry_points.iter().find(|e| e.name == name)
    }
}

/// Parse, validate and reflect WGSL source.
///
/// On failure the returned string is the build log.
pub fn reflect_wgsl(source: &str) -> Result<ProgramInfo, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|e| format!("validation error: {}", error_chain(&e)))?;

    let mut entry_points = Vec::new();
    for (index, ep) in module.entry_points.iter().enumerate() {
        if ep.stage != ShaderStage::Compute {
            continue;
        }
        let usage = info.get_entry_point(index);
        let mut args = Vec::new();

        for (handle, var) in module.global_variables.iter() {
            if usage[handle].is_empty() {
                continue;
            }
            let Some(binding) = &var.binding else {
                continue;
            };
            let var_name = var.name.clone().unwrap_or_else(|| format!("binding {}", binding.binding));
            if binding.group != 0 {
                return Err(format!(
                    "entry point `{}`: `{}` is bound in group {}; kernel arguments must live in group 0",
                    ep.name, var_name, binding.group
                ));
            }
            let kind = match var.space {
                AddressSpace::Storage { access } => ArgKind::Buffer {
                    writable: access.contains(StorageAccess::STORE),
                },
                AddressSpace::Uniform => match scalar_type(&module.types[var.ty].inner) {
                    Some(ty) => ArgKind::Scalar(ty),
                    None => ArgKind::Buffer { writable: false },
                },
                _ => {
                    return Err(format!(
                        "entry point `{}`: `{}` is not a buffer or scalar argument",
                        ep.name, var_name
                    ));
                }
            };
            args.push(ArgSlot {
                slot: binding.binding,
                name: var.name.clone(),
                kind,
            });
        }

        args.sort_by_key(|a| a.slot);
        entry_points.push(EntryPointInfo {
            name: ep.name.clone(),
            workgroup_size: ep.workgroup_size,
            args,
        });
    }

    Ok(ProgramInfo { entry_points })
}

fn scalar_type(inner: &TypeInner) -> Option<ScalarType> {
    match inner {
        TypeInner::Scalar(s) if s.width == 4 => match s.kind {
            ScalarKind::Float => Some(ScalarType::F32),
            ScalarKind::Uint => Some(ScalarType::U32),
            ScalarKind::Sint => Some(ScalarType::I32),
            _ => None,
        },
        _ => None,
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    const COPY: &str = r#"
@group(0) @binding(0) var<storage, read> src: array<vec4<f32>>;
@group(0) @binding(1) var<storage, read_write> dst: array<vec4<f32>>;
@group(0) @binding(2) var<uniform> scale: f32;

@compute @workgroup_size(64)
fn copy(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&dst)) { return; }
    dst[i] = src[i] * scale;
}

@compute @workgroup_size(32)
fn clear(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= arrayLength(&dst)) { return; }
    dst[i] = vec4<f32>(0.0);
}
"#;

    #[test]
    fn test_reflects_arguments_per_entry_point() {
        let info = reflect_wgsl(COPY).unwrap();
        assert_eq!(info.entry_points.len(), 2);

        let copy = info.entry_point("copy").unwrap();
        assert_eq!(copy.workgroup_size, [64, 1, 1]);
        let kinds: Vec<_> = copy.args.iter().map(|a| (a.slot, a.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (0, ArgKind::Buffer { writable: false }),
                (1, ArgKind::Buffer { writable: true }),
                (2, ArgKind::Scalar(ScalarType::F32)),
            ]
        );

        // Only bindings the entry point touches are arguments.
        let clear = info.entry_point("clear").unwrap();
        assert_eq!(clear.args.len(), 1);
        assert_eq!(clear.args[0].slot, 1);
    }

    #[test]
    fn test_syntax_error_returns_log() {
        let log = reflect_wgsl("@compute @workgroup_size(1) fn main( {").unwrap_err();
        assert!(!log.is_empty());
    }

    #[test]
    fn test_non_zero_group_rejected() {
        let src = r#"
@group(1) @binding(0) var<storage, read_write> data: array<f32>;
@compute @workgroup_size(1)
fn main() { data[0] = 1.0; }
"#;
        let log = reflect_wgsl(src).unwrap_err();
        assert!(log.contains("group 1"));
    }
}
