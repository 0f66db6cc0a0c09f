//! Listening TCP ports from procfs.

use std::collections::BTreeSet;
use std::path::Path;

/// Socket state code for LISTEN in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

/// Collects listening TCP ports from `<proc>/net/tcp` and `<proc>/net/tcp6`.
///
/// Missing files (non-Linux hosts, restricted containers) yield an empty set.
pub fn listening_ports(proc_root: &Path) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for table in ["net/tcp", "net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(proc_root.join(table)) {
            ports.extend(parse_tcp_table(&content));
        }
    }
    ports
}

/// Parses one procfs TCP table.
pub fn parse_tcp_table(content: &str) -> BTreeSet<u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            if *state != TCP_LISTEN {
                return None;
            }
            let (_, port_hex) = local.rsplit_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1
   1: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 2 1
   2: 0100007F:8F2A 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 3 1
";

    #[test]
    fn test_parse_only_listening_sockets() {
        let ports = parse_tcp_table(TCP_SAMPLE);
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![80, 8080]);
    }

    #[test]
    fn test_parse_ipv6_table() {
        let table = "  sl  local_address                         remote_address                        st\n   0: 00000000000000000000000000000000:01BB 00000000000000000000000000000000:0000 0A\n";
        assert!(parse_tcp_table(table).contains(&443));
    }

    #[test]
    fn test_listening_ports_missing_proc_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(listening_ports(dir.path()).is_empty());
    }

    #[test]
    fn test_listening_ports_reads_both_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/tcp"), TCP_SAMPLE).unwrap();
        std::fs::write(
            dir.path().join("net/tcp6"),
            "header\n 0: 00000000000000000000000000000000:1F91 00000000000000000000000000000000:0000 0A\n",
        )
        .unwrap();

        let ports = listening_ports(dir.path());
        assert!(ports.contains(&8080));
        assert!(ports.contains(&8081));
    }
}
