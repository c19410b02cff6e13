//! Handler name hashing.
//!
//! Request handlers, module names, label texts and config variables are all
//! identified on the wire by the 32-bit FNV-1a hash of their ASCII name.

pub type IdHash = u32;

pub const FNV_OFFSET_BASIS: IdHash = 0x811C_9DC5;
pub const FNV_PRIME: IdHash = 16_777_619;

/// 32-bit FNV-1a over the bytes of `name`.
pub fn hash_id(name: &str) -> IdHash {
    hash_bytes(name.as_bytes())
}

pub fn hash_bytes(bytes: &[u8]) -> IdHash {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ IdHash::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_name_is_offset_basis() {
        assert_eq!(hash_id(""), 0x811C_9DC5);
    }

    #[test]
    fn test_reference_values() {
        assert_eq!(hash_id("Test"), 0x2FFC_BE05);
        assert_eq!(hash_id("a"), 0xE40C_292C);
        assert_eq!(hash_id("foobar"), 0xBF9C_F968);
    }

    #[test]
    fn test_request_names_are_distinct() {
        let names = [
            "GetBombConfig",
            "GetComponentConfigByBusAddress",
            "GetClock",
            "GetStrikes",
            "AckReadyToArm",
            "AddStrike",
            "DefuseComponent",
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(hash_id(a), hash_id(b), "{a} collides with {b}");
            }
        }
    }
}
