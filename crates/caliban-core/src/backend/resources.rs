//! Machine, accelerator, and region vocabulary for the managed backends,
//! with the static compatibility tables used for client-side validation.
//!
//! The tables mirror the training service's published support matrix for
//! machine type x accelerator x count and accelerator x region.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};
use crate::config::JobMode;

/// GPU accelerators offered by the managed backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuType {
    K80,
    P4,
    P100,
    T4,
    V100,
}

impl GpuType {
    /// The backend's wire identifier.
    pub fn wire_name(&self) -> &'static str {
        match self {
            GpuType::K80 => "NVIDIA_TESLA_K80",
            GpuType::P4 => "NVIDIA_TESLA_P4",
            GpuType::P100 => "NVIDIA_TESLA_P100",
            GpuType::T4 => "NVIDIA_TESLA_T4",
            GpuType::V100 => "NVIDIA_TESLA_V100",
        }
    }

    /// Every GPU type, for error messages.
    pub fn all() -> &'static [GpuType] {
        &[GpuType::K80, GpuType::P4, GpuType::P100, GpuType::T4, GpuType::V100]
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "K80" => Some(GpuType::K80),
            "P4" => Some(GpuType::P4),
            "P100" => Some(GpuType::P100),
            "T4" => Some(GpuType::T4),
            "V100" => Some(GpuType::V100),
            _ => None,
        }
    }
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GpuType::K80 => "K80",
            GpuType::P4 => "P4",
            GpuType::P100 => "P100",
            GpuType::T4 => "T4",
            GpuType::V100 => "V100",
        };
        write!(f, "{}", name)
    }
}

/// TPU accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TpuType {
    V2,
    V3,
}

impl TpuType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            TpuType::V2 => "TPU_V2",
            TpuType::V3 => "TPU_V3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "V2" => Some(TpuType::V2),
            "V3" => Some(TpuType::V3),
            _ => None,
        }
    }
}

impl fmt::Display for TpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TpuType::V2 => write!(f, "V2"),
            TpuType::V3 => write!(f, "V3"),
        }
    }
}

/// An accelerator request: type plus count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcceleratorSpec {
    Gpu { gpu: GpuType, count: u32 },
    Tpu { tpu: TpuType, count: u32 },
}

impl AcceleratorSpec {
    /// Parses the CLI shorthand `COUNTxTYPE`, e.g. `8xV100` or `8xV2`.
    pub fn parse(s: &str) -> BackendResult<Self> {
        let mut parts = s.splitn(2, ['x', 'X']);
        let (count_s, type_s) = match (parts.next(), parts.next()) {
            (Some(c), Some(t)) => (c, t),
            _ => {
                return Err(BackendError::Validation {
                    field: "accelerator".to_string(),
                    message: format!(
                        "'{}' has no 'x' separator; expected COUNTxTYPE, like 8xV100",
                        s
                    ),
                })
            }
        };

        let count: u32 = count_s.parse().map_err(|_| BackendError::Validation {
            field: "accelerator".to_string(),
            message: format!("the count '{}' isn't a number", count_s),
        })?;

        if let Some(gpu) = GpuType::parse(type_s) {
            return Ok(AcceleratorSpec::Gpu { gpu, count });
        }
        if let Some(tpu) = TpuType::parse(type_s) {
            return Ok(AcceleratorSpec::Tpu { tpu, count });
        }
        Err(BackendError::Validation {
            field: "accelerator".to_string(),
            message: format!(
                "'{}' isn't a valid accelerator type; GPU types: {:?}, TPU types: [V2, V3]",
                type_s,
                GpuType::all().iter().map(|g| g.to_string()).collect::<Vec<_>>()
            ),
        })
    }

    /// The backend's accelerator config object.
    pub fn wire_config(&self) -> serde_json::Value {
        match self {
            AcceleratorSpec::Gpu { gpu, count } => {
                serde_json::json!({"type": gpu.wire_name(), "count": count})
            }
            AcceleratorSpec::Tpu { tpu, count } => {
                serde_json::json!({"type": tpu.wire_name(), "count": count})
            }
        }
    }

    pub fn count(&self) -> u32 {
        match self {
            AcceleratorSpec::Gpu { count, .. } | AcceleratorSpec::Tpu { count, .. } => *count,
        }
    }
}

impl fmt::Display for AcceleratorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorSpec::Gpu { gpu, count } => write!(f, "{}x{}", count, gpu),
            AcceleratorSpec::Tpu { tpu, count } => write!(f, "{}x{}", count, tpu),
        }
    }
}

/// Machine types offered by the training service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum MachineType {
    Standard_4,
    Standard_8,
    Standard_16,
    Standard_32,
    Standard_64,
    Standard_96,
    Highmem_2,
    Highmem_4,
    Highmem_8,
    Highmem_16,
    Highmem_32,
    Highmem_64,
    Highmem_96,
    Highcpu_16,
    Highcpu_32,
    Highcpu_64,
    Highcpu_96,
    CloudTpu,
}

impl MachineType {
    /// The backend's wire identifier, e.g. `n1-standard-8`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            MachineType::Standard_4 => "n1-standard-4",
            MachineType::Standard_8 => "n1-standard-8",
            MachineType::Standard_16 => "n1-standard-16",
            MachineType::Standard_32 => "n1-standard-32",
            MachineType::Standard_64 => "n1-standard-64",
            MachineType::Standard_96 => "n1-standard-96",
            MachineType::Highmem_2 => "n1-highmem-2",
            MachineType::Highmem_4 => "n1-highmem-4",
            MachineType::Highmem_8 => "n1-highmem-8",
            MachineType::Highmem_16 => "n1-highmem-16",
            MachineType::Highmem_32 => "n1-highmem-32",
            MachineType::Highmem_64 => "n1-highmem-64",
            MachineType::Highmem_96 => "n1-highmem-96",
            MachineType::Highcpu_16 => "n1-highcpu-16",
            MachineType::Highcpu_32 => "n1-highcpu-32",
            MachineType::Highcpu_64 => "n1-highcpu-64",
            MachineType::Highcpu_96 => "n1-highcpu-96",
            MachineType::CloudTpu => "cloud_tpu",
        }
    }

    /// Every machine type, for parse errors and validation sweeps.
    pub fn all() -> &'static [MachineType] {
        &[
            MachineType::Standard_4,
            MachineType::Standard_8,
            MachineType::Standard_16,
            MachineType::Standard_32,
            MachineType::Standard_64,
            MachineType::Standard_96,
            MachineType::Highmem_2,
            MachineType::Highmem_4,
            MachineType::Highmem_8,
            MachineType::Highmem_16,
            MachineType::Highmem_32,
            MachineType::Highmem_64,
            MachineType::Highmem_96,
            MachineType::Highcpu_16,
            MachineType::Highcpu_32,
            MachineType::Highcpu_64,
            MachineType::Highcpu_96,
            MachineType::CloudTpu,
        ]
    }

    /// Parses either the wire name (`n1-standard-8`) or the short form
    /// (`standard_8`).
    pub fn parse(s: &str) -> BackendResult<Self> {
        let lowered = s.to_ascii_lowercase();
        let normalized = lowered.strip_prefix("n1-").unwrap_or(&lowered).replace('-', "_");
        MachineType::all()
            .iter()
            .copied()
            .find(|m| {
                m.wire_name() == lowered
                    || m.wire_name().trim_start_matches("n1-").replace('-', "_") == normalized
            })
            .ok_or_else(|| BackendError::Validation {
                field: "machine_type".to_string(),
                message: format!(
                    "'{}' isn't a valid machine type; must be one of {:?}",
                    s,
                    MachineType::all().iter().map(|m| m.wire_name()).collect::<Vec<_>>()
                ),
            })
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// Regions where the training service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    UsWest1,
    UsWest2,
    UsCentral1,
    UsEast1,
    UsEast4,
    EuropeWest1,
    EuropeWest4,
    EuropeNorth1,
    AsiaSoutheast1,
    AsiaEast1,
    AsiaNortheast1,
}

/// Region used when the invocation and environment specify none.
pub const DEFAULT_REGION: Region = Region::UsCentral1;

impl Region {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Region::UsWest1 => "us-west1",
            Region::UsWest2 => "us-west2",
            Region::UsCentral1 => "us-central1",
            Region::UsEast1 => "us-east1",
            Region::UsEast4 => "us-east4",
            Region::EuropeWest1 => "europe-west1",
            Region::EuropeWest4 => "europe-west4",
            Region::EuropeNorth1 => "europe-north1",
            Region::AsiaSoutheast1 => "asia-southeast1",
            Region::AsiaEast1 => "asia-east1",
            Region::AsiaNortheast1 => "asia-northeast1",
        }
    }

    pub fn all() -> &'static [Region] {
        &[
            Region::UsWest1,
            Region::UsWest2,
            Region::UsCentral1,
            Region::UsEast1,
            Region::UsEast4,
            Region::EuropeWest1,
            Region::EuropeWest4,
            Region::EuropeNorth1,
            Region::AsiaSoutheast1,
            Region::AsiaEast1,
            Region::AsiaNortheast1,
        ]
    }

    pub fn parse(s: &str) -> BackendResult<Self> {
        let lowered = s.to_ascii_lowercase();
        Region::all().iter().copied().find(|r| r.wire_name() == lowered).ok_or_else(|| {
            BackendError::Validation {
                field: "region".to_string(),
                message: format!(
                    "'{}' isn't a valid region; must be one of {:?}",
                    s,
                    Region::all().iter().map(|r| r.wire_name()).collect::<Vec<_>>()
                ),
            }
        })
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// Default machine type per job mode.
pub fn default_machine_type(mode: JobMode) -> MachineType {
    match mode {
        JobMode::Gpu => MachineType::Standard_8,
        JobMode::Cpu => MachineType::Highcpu_32,
        JobMode::Tpu => MachineType::CloudTpu,
    }
}

/// An accelerator either as a GPU or TPU type, erased of its count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accelerator {
    Gpu(GpuType),
    Tpu(TpuType),
}

impl From<&AcceleratorSpec> for Accelerator {
    fn from(spec: &AcceleratorSpec) -> Self {
        match spec {
            AcceleratorSpec::Gpu { gpu, .. } => Accelerator::Gpu(*gpu),
            AcceleratorSpec::Tpu { tpu, .. } => Accelerator::Tpu(*tpu),
        }
    }
}

/// Counts of an accelerator supported by one machine type. Empty means the
/// pair is incompatible.
fn compatible_counts(machine: MachineType, accel: Accelerator) -> &'static [u32] {
    use Accelerator::{Gpu, Tpu};
    use GpuType::{K80, P4, P100, T4, V100};
    use MachineType::*;

    match (machine, accel) {
        (CloudTpu, Tpu(_)) => &[8],
        (CloudTpu, Gpu(_)) => &[],
        (_, Tpu(_)) => &[],

        // Small standard and highmem machines share the widest support.
        (Standard_4 | Standard_8 | Highmem_2 | Highmem_4 | Highmem_8, Gpu(gpu)) => match gpu {
            K80 | V100 => &[1, 2, 4, 8],
            P4 | P100 | T4 => &[1, 2, 4],
        },

        (Standard_16 | Highmem_16 | Highcpu_16, Gpu(gpu)) => match gpu {
            K80 | V100 => &[2, 4, 8],
            P4 | P100 | T4 => &[1, 2, 4],
        },

        (Standard_32 | Highmem_32 | Highcpu_32, Gpu(gpu)) => match gpu {
            K80 | V100 => &[4, 8],
            P4 | P100 | T4 => &[2, 4],
        },

        (Highcpu_64, Gpu(gpu)) => match gpu {
            K80 | V100 => &[8],
            P4 | P100 | T4 => &[4],
        },

        // The largest machines only take the newest cards.
        (Standard_64 | Standard_96 | Highmem_64 | Highmem_96 | Highcpu_96, Gpu(gpu)) => {
            match gpu {
                P4 | T4 => &[4],
                V100 => &[8],
                K80 | P100 => &[],
            }
        }
    }
}

/// Regions where an accelerator is available.
fn region_support(accel: Accelerator) -> &'static [Region] {
    use Accelerator::{Gpu, Tpu};
    use Region::*;
    match accel {
        Tpu(_) => &[UsCentral1],
        Gpu(GpuType::K80) => &[UsWest1, UsCentral1, UsEast1, EuropeWest1, AsiaEast1],
        Gpu(GpuType::P4) => &[UsWest2, UsCentral1, UsEast4, EuropeWest4, AsiaSoutheast1],
        Gpu(GpuType::P100) => &[UsWest1, UsCentral1, UsEast1, EuropeWest1, AsiaEast1],
        Gpu(GpuType::T4) => &[UsWest1, UsCentral1, UsEast1, EuropeWest4, AsiaSoutheast1],
        Gpu(GpuType::V100) => &[UsWest1, UsCentral1, EuropeWest4, AsiaEast1],
    }
}

/// The set of counts valid for an accelerator on any machine type, sorted.
pub fn accelerator_counts(spec: &AcceleratorSpec) -> Vec<u32> {
    let accel = Accelerator::from(spec);
    let mut counts: Vec<u32> = MachineType::all()
        .iter()
        .flat_map(|m| compatible_counts(*m, accel).iter().copied())
        .collect();
    counts.sort_unstable();
    counts.dedup();
    counts
}

/// Machine types that accept this accelerator request.
pub fn allowed_machine_types(spec: &AcceleratorSpec) -> Vec<MachineType> {
    let accel = Accelerator::from(spec);
    MachineType::all()
        .iter()
        .copied()
        .filter(|m| compatible_counts(*m, accel).contains(&spec.count()))
        .collect()
}

/// Regions supporting this accelerator.
pub fn supported_regions(spec: &AcceleratorSpec) -> Vec<Region> {
    region_support(Accelerator::from(spec)).to_vec()
}

/// Validates a `(machine type, accelerator, region)` combination against
/// the compatibility tables, naming the offending dimension and the nearest
/// valid values on failure.
pub fn validate_combination(
    machine: Option<MachineType>,
    accelerator: Option<&AcceleratorSpec>,
    region: Option<Region>,
) -> BackendResult<()> {
    let spec = match accelerator {
        Some(spec) => spec,
        None => return Ok(()),
    };

    let valid_counts = accelerator_counts(spec);
    if !valid_counts.contains(&spec.count()) {
        return Err(BackendError::Validation {
            field: "accelerator_count".to_string(),
            message: format!(
                "{} accelerators of type {} aren't available for any machine type; \
                 try one of the following counts: {:?}",
                spec.count(),
                match spec {
                    AcceleratorSpec::Gpu { gpu, .. } => gpu.to_string(),
                    AcceleratorSpec::Tpu { tpu, .. } => tpu.to_string(),
                },
                valid_counts
            ),
        });
    }

    if let Some(machine) = machine {
        let counts = compatible_counts(machine, Accelerator::from(spec));
        if !counts.contains(&spec.count()) {
            let allowed = allowed_machine_types(spec);
            return Err(BackendError::Validation {
                field: "machine_type".to_string(),
                message: format!(
                    "machine type {} doesn't support {}; compatible machine types: {:?}",
                    machine,
                    spec,
                    allowed.iter().map(|m| m.wire_name()).collect::<Vec<_>>()
                ),
            });
        }
    }

    if let Some(region) = region {
        let regions = supported_regions(spec);
        if !regions.contains(&region) {
            return Err(BackendError::Validation {
                field: "region".to_string(),
                message: format!(
                    "region {} doesn't support {}; supported regions: {:?}",
                    region,
                    spec,
                    regions.iter().map(|r| r.wire_name()).collect::<Vec<_>>()
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accelerator_shorthand() {
        assert_eq!(
            AcceleratorSpec::parse("8xV100").unwrap(),
            AcceleratorSpec::Gpu { gpu: GpuType::V100, count: 8 }
        );
        assert_eq!(
            AcceleratorSpec::parse("8xv2").unwrap(),
            AcceleratorSpec::Tpu { tpu: TpuType::V2, count: 8 }
        );
        assert!(AcceleratorSpec::parse("V100").is_err());
        assert!(AcceleratorSpec::parse("threexV100").is_err());
        assert!(AcceleratorSpec::parse("2xH100").is_err());
    }

    #[test]
    fn test_invalid_count_names_valid_counts() {
        let spec = AcceleratorSpec::Gpu { gpu: GpuType::V100, count: 3 };
        let err = validate_combination(None, Some(&spec), None).unwrap_err();
        match err {
            BackendError::Validation { field, message } => {
                assert_eq!(field, "accelerator_count");
                assert!(message.contains("[1, 2, 4, 8]"), "message: {}", message);
            }
            other => panic!("expected Validation, got {:?}", other),
        }
    }

    #[test]
    fn test_machine_accelerator_compatibility() {
        let spec = AcceleratorSpec::Gpu { gpu: GpuType::K80, count: 8 };
        // Large standard machines never take K80s.
        assert!(validate_combination(Some(MachineType::Standard_64), Some(&spec), None).is_err());
        assert!(validate_combination(Some(MachineType::Standard_8), Some(&spec), None).is_ok());
    }

    #[test]
    fn test_region_support() {
        let spec = AcceleratorSpec::Gpu { gpu: GpuType::V100, count: 8 };
        assert!(validate_combination(None, Some(&spec), Some(Region::UsCentral1)).is_ok());
        let err =
            validate_combination(None, Some(&spec), Some(Region::EuropeNorth1)).unwrap_err();
        assert!(matches!(err, BackendError::Validation { field, .. } if field == "region"));
    }

    #[test]
    fn test_tpu_requires_cloud_tpu_machine() {
        let spec = AcceleratorSpec::Tpu { tpu: TpuType::V2, count: 8 };
        assert!(validate_combination(Some(MachineType::CloudTpu), Some(&spec), None).is_ok());
        assert!(validate_combination(Some(MachineType::Standard_8), Some(&spec), None).is_err());
        // TPUs come in pods of 8 only.
        let wrong = AcceleratorSpec::Tpu { tpu: TpuType::V2, count: 4 };
        assert!(validate_combination(None, Some(&wrong), None).is_err());
    }

    #[test]
    fn test_no_accelerator_always_valid() {
        assert!(validate_combination(Some(MachineType::Highcpu_32), None, None).is_ok());
    }

    #[test]
    fn test_machine_type_parse_forms() {
        assert_eq!(MachineType::parse("n1-standard-8").unwrap(), MachineType::Standard_8);
        assert_eq!(MachineType::parse("standard_8").unwrap(), MachineType::Standard_8);
        assert_eq!(MachineType::parse("cloud_tpu").unwrap(), MachineType::CloudTpu);
        assert!(MachineType::parse("m2-megamem").is_err());
    }

    #[test]
    fn test_region_parse() {
        assert_eq!(Region::parse("us-west1").unwrap(), Region::UsWest1);
        assert!(Region::parse("us-moon1").is_err());
    }

    #[test]
    fn test_default_machine_types() {
        assert_eq!(default_machine_type(JobMode::Cpu), MachineType::Highcpu_32);
        assert_eq!(default_machine_type(JobMode::Gpu), MachineType::Standard_8);
        assert_eq!(default_machine_type(JobMode::Tpu), MachineType::CloudTpu);
    }
}
