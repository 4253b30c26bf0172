//! Utility functions for Concord

use if_addrs::IfAddr;

/// Get every non-loopback IPv4 address of this host.
///
/// Falls back to `127.0.0.1` when no such interface exists.
pub fn local_ips() -> Vec<String> {
    let ips: Vec<String> = if_addrs::get_if_addrs()
        .map(|addrs| {
            addrs
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .filter_map(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if ips.is_empty() {
        vec!["127.0.0.1".to_string()]
    } else {
        ips
    }
}

/// Current wall-clock time in Unix milliseconds
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ips_returns_valid_ips() {
        let ips = local_ips();
        assert!(!ips.is_empty());
        for ip in ips {
            assert_eq!(ip.split('.').filter_map(|s| s.parse::<u8>().ok()).count(), 4);
        }
    }

    #[test]
    fn test_current_timestamp_is_positive() {
        assert!(current_timestamp() > 0);
    }
}
