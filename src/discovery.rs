//! Neighbour discovery: runs an external command and parses one candidate
//! peer address per line of stdout.
//!
//! Grounded on `examples/original_source/src/sharedstate.cc`'s
//! `getCandidatesNeighbours`: spawn the configured discovery command, drain
//! its stdout to EOF, wait for it to terminate, then parse each non-empty
//! line as an IP address and pair it with the well-known sync port.

use std::net::{IpAddr, SocketAddr};

use crate::error::CliError;
use crate::proc::ChildProcess;
use crate::reactor::Reactor;
use crate::wire::SHARED_STATE_PORT;

const READ_CHUNK: usize = 1024;

/// Runs `command`, collects its stdout, and parses each line as a
/// candidate peer address. Unlike `hooks`/config parsing, an invalid line
/// here fails the whole call (spec §6: "invalid lines fail the call"),
/// matching `getCandidatesNeighbours`'s `sockaddr_storage_inet_pton`
/// check, which returns false on the first line that doesn't parse.
pub async fn candidate_neighbours(
    command: &str,
    reactor: &Reactor,
) -> Result<Vec<SocketAddr>, CliError> {
    let child = ChildProcess::spawn(command, reactor)
        .map_err(|e| CliError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

    let mut output = Vec::new();
    loop {
        let mut chunk = [0u8; READ_CHUNK];
        let n = child
            .read_stdout(&mut chunk)
            .await
            .map_err(|e| CliError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        if n == 0 {
            break;
        }
        output.extend_from_slice(&chunk[..n]);
    }

    child
        .wait_for_termination(reactor)
        .await
        .map_err(|e| CliError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

    let text = String::from_utf8_lossy(&output);
    parse_candidates(&text)
}

fn parse_candidates(text: &str) -> Result<Vec<SocketAddr>, CliError> {
    text.lines()
        .map(|line| {
            line.parse::<IpAddr>()
                .map(|ip| SocketAddr::new(ip, SHARED_STATE_PORT))
                .map_err(|_| CliError::Usage(format!("invalid peer address: {line}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_ip_lines() {
        let addrs = parse_candidates("10.0.0.1\n10.0.0.2\n").unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].port(), SHARED_STATE_PORT);
    }

    #[test]
    fn invalid_line_fails_the_whole_call() {
        assert!(parse_candidates("10.0.0.1\nnot-an-ip\n").is_err());
    }

    #[test]
    fn accepts_ipv6_candidates() {
        let addrs = parse_candidates("fe80::1\n").unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv6());
    }
}
