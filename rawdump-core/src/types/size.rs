///! This module contains helper functions for creating various byte sizes.
///! All functions are const and can be used to define constants.

/// Returns a u64 representing the length in bytes from the given number of kilobytes.
pub const fn kb(kb: u64) -> u64 {
    kb * 1024
}

/// Returns a u64 representing the length in bytes from the given number of megabytes.
pub const fn mb(mb: u64) -> u64 {
    kb(mb) * 1024
}

/// Returns a u64 representing the length in bytes from the given number of gigabytes.
pub const fn gb(gb: u64) -> u64 {
    mb(gb) * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from() {
        assert_eq!(kb(20), 20480);
        assert_eq!(mb(20), 20_971_520);
        assert_eq!(mb(512), 0x2000_0000);
        assert_eq!(gb(20), 21_474_836_480);
    }
}
