//! Virtual address parsing.
//!
//! Virtual raw addresses bypass physical connections. They are written as
//! `<family>.<id>`:
//!
//! - `vbool.<id>`: boolean
//! - `vint.<id>`: short, integer or long
//! - `vstring.<id>`: string
//!
//! A bare family prefix (`vbool`, `vbool.`) is rejected.

use crate::core::data::ValueType;
use crate::core::error::{GatewayError, Result};

/// Virtual address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualFamily {
    Bool,
    Int,
    String,
}

impl VirtualFamily {
    const ALL: [VirtualFamily; 3] = [Self::Bool, Self::Int, Self::String];

    /// Family prefix as written in configuration.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Bool => "vbool",
            Self::Int => "vint",
            Self::String => "vstring",
        }
    }

    /// Whether a declared value type fits this family.
    pub fn accepts(self, value_type: ValueType) -> bool {
        match self {
            Self::Bool => value_type == ValueType::Boolean,
            Self::Int => matches!(
                value_type,
                ValueType::Short | ValueType::Integer | ValueType::Long
            ),
            Self::String => value_type == ValueType::String,
        }
    }
}

impl std::fmt::Display for VirtualFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A parsed virtual address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualAddress<'a> {
    pub family: VirtualFamily,
    pub id: &'a str,
}

fn split_family(raw: &str) -> Option<(VirtualFamily, &str)> {
    VirtualFamily::ALL.into_iter().find_map(|family| {
        let rest = raw.strip_prefix(family.prefix())?;
        // "vboolean.x" is not the vbool family
        if rest.is_empty() || rest.starts_with('.') {
            Some((family, rest))
        } else {
            None
        }
    })
}

/// Whether `raw` is written in one of the virtual families.
///
/// Malformed virtual addresses (bare prefixes) also return `true` so that
/// they are routed to [`parse_virtual_address`] and rejected there.
pub fn is_virtual_address(raw: &str) -> bool {
    split_family(raw).is_some()
}

/// Parse a virtual address.
pub fn parse_virtual_address(raw: &str) -> Result<VirtualAddress<'_>> {
    let (family, rest) = split_family(raw).ok_or_else(|| {
        GatewayError::Config(format!("{} is not a virtual address", raw))
    })?;

    let id = rest.strip_prefix('.').unwrap_or(rest);
    if id.trim().is_empty() {
        return Err(GatewayError::Config(format!(
            "virtual address {} needs an identifier after '{}.'",
            raw,
            family.prefix()
        )));
    }

    Ok(VirtualAddress { family, id })
}

/// Parse and check the family against the declared type.
pub fn validate_virtual_address(raw: &str, value_type: ValueType) -> Result<VirtualAddress<'_>> {
    let parsed = parse_virtual_address(raw)?;
    if !parsed.family.accepts(value_type) {
        return Err(GatewayError::Config(format!(
            "virtual address {} is a {} address but is declared {}",
            raw, parsed.family, value_type
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_families() {
        let a = parse_virtual_address("vbool.running").unwrap();
        assert_eq!(a.family, VirtualFamily::Bool);
        assert_eq!(a.id, "running");

        let a = parse_virtual_address("vint.counter.1").unwrap();
        assert_eq!(a.family, VirtualFamily::Int);
        assert_eq!(a.id, "counter.1");

        assert_eq!(
            parse_virtual_address("vstring.label").unwrap().family,
            VirtualFamily::String
        );
    }

    #[test]
    fn test_bare_prefix_rejected() {
        for raw in ["vbool", "vbool.", "vint.", "vstring. "] {
            assert!(is_virtual_address(raw), "{}", raw);
            assert!(
                matches!(parse_virtual_address(raw), Err(GatewayError::Config(_))),
                "{}",
                raw
            );
        }
    }

    #[test]
    fn test_physical_addresses_are_not_virtual() {
        assert!(!is_virtual_address("DO.1"));
        assert!(!is_virtual_address("vboolean.x"));
        assert!(!is_virtual_address("192.168.0.1:502"));
    }

    #[test]
    fn test_family_must_match_type() {
        assert!(validate_virtual_address("vbool.running", ValueType::Boolean).is_ok());
        assert!(validate_virtual_address("vint.count", ValueType::Long).is_ok());
        assert!(matches!(
            validate_virtual_address("vbool.running", ValueType::String),
            Err(GatewayError::Config(_))
        ));
    }
}
