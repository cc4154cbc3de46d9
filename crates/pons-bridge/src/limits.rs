//! Process-wide codec limits, read once from the environment.

use once_cell::sync::OnceCell;

use crate::{ENV_MAX_DEPTH, ENV_MAX_ENTRIES, ENV_MAX_VALUE_BYTES};

pub const DEFAULT_MAX_VALUE_BYTES: u32 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_DEPTH: u32 = 64;
pub const DEFAULT_MAX_ENTRIES: u32 = 100_000;

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_value_bytes: u32,
    pub max_depth: u32,
    pub max_entries: u32,
}

static LIMITS: OnceCell<Limits> = OnceCell::new();

pub fn limits() -> &'static Limits {
    LIMITS.get_or_init(load_limits)
}

pub(crate) fn load_limits() -> Limits {
    Limits {
        max_value_bytes: env_u32_nonzero(ENV_MAX_VALUE_BYTES, DEFAULT_MAX_VALUE_BYTES),
        max_depth: env_u32_nonzero(ENV_MAX_DEPTH, DEFAULT_MAX_DEPTH),
        max_entries: env_u32_nonzero(ENV_MAX_ENTRIES, DEFAULT_MAX_ENTRIES),
    }
}

fn env_u32_nonzero(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(s) => match s.trim().parse::<u32>() {
            Ok(v) if v > 0 => v,
            _ => default,
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test below touches its own variable; the parallel test runner
    // shares one environment.
    #[test]
    fn defaults_apply_without_env() {
        assert_eq!(load_limits().max_value_bytes, DEFAULT_MAX_VALUE_BYTES);
    }

    #[test]
    fn env_override_applies() {
        std::env::set_var(ENV_MAX_DEPTH, "9");
        assert_eq!(load_limits().max_depth, 9);
        std::env::remove_var(ENV_MAX_DEPTH);
    }

    #[test]
    fn zero_and_garbage_fall_back_to_defaults() {
        std::env::set_var(ENV_MAX_ENTRIES, "0");
        assert_eq!(load_limits().max_entries, DEFAULT_MAX_ENTRIES);
        std::env::set_var(ENV_MAX_ENTRIES, "plenty");
        assert_eq!(load_limits().max_entries, DEFAULT_MAX_ENTRIES);
        std::env::remove_var(ENV_MAX_ENTRIES);
    }
}
