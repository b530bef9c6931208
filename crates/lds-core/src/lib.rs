#![forbid(unsafe_code)]

mod value;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use value::{IValue, MAX_EXACT_DOUBLE_INT, TensorValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda,
}

/// Tags naming a kernel flavor (backend), an autograd flavor, or a
/// transformation-layer marker. `Undefined` is a sentinel and owns no bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DispatchKey {
    Undefined = 0,
    CPU = 1,
    CUDA = 2,
    SparseCPU = 3,
    SparseCUDA = 4,
    QuantizedCPU = 5,
    MkldnnCPU = 6,
    DynamicLayerBack = 7,
    Autograd = 8,
    AutogradOther = 9,
    AutogradCPU = 10,
    AutogradCUDA = 11,
    Batched = 12,
    DynamicLayerFront = 13,
}

const ALL_KEYS: [DispatchKey; 13] = [
    DispatchKey::CPU,
    DispatchKey::CUDA,
    DispatchKey::SparseCPU,
    DispatchKey::SparseCUDA,
    DispatchKey::QuantizedCPU,
    DispatchKey::MkldnnCPU,
    DispatchKey::DynamicLayerBack,
    DispatchKey::Autograd,
    DispatchKey::AutogradOther,
    DispatchKey::AutogradCPU,
    DispatchKey::AutogradCUDA,
    DispatchKey::Batched,
    DispatchKey::DynamicLayerFront,
];

/// Highest priority first. Front outranks everything so the layer stack sees
/// every call; Back sits below every transformation and autograd kernel but
/// above the backends.
pub const DISPATCH_PRIORITY: [DispatchKey; 13] = [
    DispatchKey::DynamicLayerFront,
    DispatchKey::Batched,
    DispatchKey::AutogradCUDA,
    DispatchKey::AutogradCPU,
    DispatchKey::AutogradOther,
    DispatchKey::Autograd,
    DispatchKey::DynamicLayerBack,
    DispatchKey::SparseCUDA,
    DispatchKey::SparseCPU,
    DispatchKey::QuantizedCPU,
    DispatchKey::MkldnnCPU,
    DispatchKey::CUDA,
    DispatchKey::CPU,
];

impl DispatchKey {
    #[must_use]
    pub const fn all() -> &'static [DispatchKey] {
        &ALL_KEYS
    }

    #[must_use]
    pub const fn bit(self) -> u64 {
        match self {
            Self::Undefined => 0,
            _ => 1u64 << (self as u8),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::CPU => "CPU",
            Self::CUDA => "CUDA",
            Self::SparseCPU => "SparseCPU",
            Self::SparseCUDA => "SparseCUDA",
            Self::QuantizedCPU => "QuantizedCPU",
            Self::MkldnnCPU => "MkldnnCPU",
            Self::DynamicLayerBack => "DynamicLayerBack",
            Self::Autograd => "Autograd",
            Self::AutogradOther => "AutogradOther",
            Self::AutogradCPU => "AutogradCPU",
            Self::AutogradCUDA => "AutogradCUDA",
            Self::Batched => "Batched",
            Self::DynamicLayerFront => "DynamicLayerFront",
        }
    }

    /// Rank in [`DISPATCH_PRIORITY`]; lower is selected first.
    #[must_use]
    pub fn priority_rank(self) -> Option<usize> {
        DISPATCH_PRIORITY.iter().position(|key| *key == self)
    }

    /// Concrete keys an alias stands for. Empty for non-alias keys.
    #[must_use]
    pub const fn alias_members(self) -> DispatchKeySet {
        match self {
            Self::Autograd => DispatchKeySet::EMPTY
                .with(Self::AutogradOther)
                .with(Self::AutogradCPU)
                .with(Self::AutogradCUDA),
            _ => DispatchKeySet::EMPTY,
        }
    }

    /// The alias a concrete key belongs to, if any.
    #[must_use]
    pub const fn alias_parent(self) -> Option<DispatchKey> {
        match self {
            Self::AutogradOther | Self::AutogradCPU | Self::AutogradCUDA => Some(Self::Autograd),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_backend(self) -> bool {
        matches!(
            self,
            Self::CPU
                | Self::CUDA
                | Self::SparseCPU
                | Self::SparseCUDA
                | Self::QuantizedCPU
                | Self::MkldnnCPU
        )
    }

    #[must_use]
    pub const fn is_autograd(self) -> bool {
        matches!(
            self,
            Self::Autograd | Self::AutogradOther | Self::AutogradCPU | Self::AutogradCUDA
        )
    }

    #[must_use]
    pub const fn is_transformation_marker(self) -> bool {
        matches!(
            self,
            Self::DynamicLayerFront | Self::DynamicLayerBack | Self::Batched
        )
    }

    /// Device a key is tied to. Keys without a device pass argument
    /// narrowing untouched.
    #[must_use]
    pub const fn device(self) -> Option<Device> {
        match self {
            Self::CPU | Self::SparseCPU | Self::QuantizedCPU | Self::MkldnnCPU | Self::AutogradCPU => {
                Some(Device::Cpu)
            }
            Self::CUDA | Self::SparseCUDA | Self::AutogradCUDA => Some(Device::Cuda),
            _ => None,
        }
    }
}

impl Device {
    #[must_use]
    pub const fn autograd_key(self) -> DispatchKey {
        match self {
            Self::Cpu => DispatchKey::AutogradCPU,
            Self::Cuda => DispatchKey::AutogradCUDA,
        }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DispatchKey {
    type Err = DispatchKeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed == DispatchKey::Undefined.name() {
            return Ok(DispatchKey::Undefined);
        }
        ALL_KEYS
            .iter()
            .copied()
            .find(|key| key.name() == trimmed)
            .ok_or_else(|| DispatchKeyError::UnknownKeyName(trimmed.to_string()))
    }
}

const FULL_BITS: u64 = {
    let mut bits = 0u64;
    let mut idx = 0;
    while idx < ALL_KEYS.len() {
        bits |= ALL_KEYS[idx].bit();
        idx += 1;
    }
    bits
};

const DEVICE_BITS: u64 = {
    let mut bits = 0u64;
    let mut idx = 0;
    while idx < ALL_KEYS.len() {
        if ALL_KEYS[idx].device().is_some() {
            bits |= ALL_KEYS[idx].bit();
        }
        idx += 1;
    }
    bits
};

/// Bitmask set of dispatch keys. The algebra never expands alias keys;
/// callers that mean "the whole alias" go through [`DispatchKeySet::expand_aliases`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    pub const EMPTY: Self = Self { bits: 0 };
    pub const FULL: Self = Self { bits: FULL_BITS };
    /// Every key bound to a device.
    pub const DEVICE_KEYS: Self = Self { bits: DEVICE_BITS };

    #[must_use]
    pub const fn empty() -> Self {
        Self::EMPTY
    }

    #[must_use]
    pub const fn full() -> Self {
        Self::FULL
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    pub fn from_bits_checked(bits: u64) -> Result<Self, DispatchKeyError> {
        let unknown = bits & !FULL_BITS;
        if unknown != 0 {
            return Err(DispatchKeyError::UnknownBits {
                unknown_mask: unknown,
            });
        }
        Ok(Self { bits })
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    pub fn remove(&mut self, key: DispatchKey) {
        self.bits &= !key.bit();
    }

    #[must_use]
    pub const fn with(self, key: DispatchKey) -> Self {
        Self {
            bits: self.bits | key.bit(),
        }
    }

    #[must_use]
    pub const fn without(self, key: DispatchKey) -> Self {
        Self {
            bits: self.bits & !key.bit(),
        }
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        let bit = key.bit();
        bit != 0 && (self.bits & bit) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self {
            bits: self.bits & !other.bits,
        }
    }

    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.bits & !other.bits == 0
    }

    /// Adds the members of every alias key present in the set.
    #[must_use]
    pub const fn expand_aliases(self) -> Self {
        if self.has(DispatchKey::Autograd) {
            self.union(DispatchKey::Autograd.alias_members())
        } else {
            self
        }
    }

    /// Keys in the set, highest priority first.
    pub fn iter(self) -> impl Iterator<Item = DispatchKey> {
        DISPATCH_PRIORITY
            .into_iter()
            .filter(move |key| self.has(*key))
    }

    pub fn highest_priority_type_id(self) -> Result<DispatchKey, DispatchKeyError> {
        if self.is_empty() {
            return Err(DispatchKeyError::EmptySet);
        }
        self.iter().next().ok_or(DispatchKeyError::EmptySet)
    }
}

impl FromIterator<DispatchKey> for DispatchKeySet {
    fn from_iter<T: IntoIterator<Item = DispatchKey>>(iter: T) -> Self {
        let mut out = Self::empty();
        for key in iter {
            out.add(key);
        }
        out
    }
}

impl fmt::Display for DispatchKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DispatchKeySet(")?;
        for (idx, key) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            f.write_str(key.name())?;
        }
        f.write_str(")")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchKeyError {
    EmptySet,
    UnknownBits { unknown_mask: u64 },
    UnknownKeyName(String),
    UndefinedKey,
    NotABackendKey(DispatchKey),
}

impl fmt::Display for DispatchKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySet => write!(f, "dispatch keyset is empty"),
            Self::UnknownBits { unknown_mask } => {
                write!(
                    f,
                    "dispatch keyset has unknown bitmask 0x{unknown_mask:016x}"
                )
            }
            Self::UnknownKeyName(name) => write!(f, "unknown dispatch key name '{name}'"),
            Self::UndefinedKey => write!(f, "dispatch key Undefined is not allowed here"),
            Self::NotABackendKey(key) => write!(f, "dispatch key {key} is not a backend key"),
        }
    }
}

impl std::error::Error for DispatchKeyError {}
