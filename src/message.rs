//! 대역외(out-of-band) 전송 협상 메시지
//!
//! 상호운용성을 위해 토큰 순서와 표기를 비트 단위로 보존해야 한다.
//! - 제안: `DCC SEND <name> <ip> <port> <size>` (ip는 u32 십진수)
//! - 재개 요청: `DCC RESUME <name> <port> <offset>`
//! - 재개 승인: `DCC ACCEPT <name> <port> <offset>`
//! - 데이터 채널 ACK: 누적 수신 바이트의 4바이트 big-endian

/// CTCP 구분 문자
pub const CTCP_MARKER: char = '\x01';

/// DCC 협상 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dcc {
    /// 파일 제안 (송신측 → 수신측)
    Send {
        name: String,
        ip: u32,
        port: u16,
        size: u64,
    },

    /// 재개 요청 (수신측 → 송신측)
    Resume {
        name: String,
        port: u16,
        offset: u64,
    },

    /// 재개 승인 (송신측 → 수신측)
    Accept {
        name: String,
        port: u16,
        offset: u64,
    },
}

impl Dcc {
    /// 와이어 표현으로 직렬화 (CTCP 프레이밍 포함)
    pub fn to_wire(&self) -> String {
        match self {
            Dcc::Send {
                name,
                ip,
                port,
                size,
            } => format!("{CTCP_MARKER}DCC SEND {name} {ip} {port} {size}{CTCP_MARKER}"),
            Dcc::Resume { name, port, offset } => {
                format!("{CTCP_MARKER}DCC RESUME {name} {port} {offset}{CTCP_MARKER}")
            }
            Dcc::Accept { name, port, offset } => {
                format!("{CTCP_MARKER}DCC ACCEPT {name} {port} {offset}{CTCP_MARKER}")
            }
        }
    }

    /// 와이어 표현에서 역직렬화
    ///
    /// CTCP 마커는 있어도 없어도 수용한다. 숫자 토큰이 깨졌으면 None.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_matches(CTCP_MARKER).trim();
        let mut parts = line.split_whitespace();

        if parts.next()? != "DCC" {
            return None;
        }

        let verb = parts.next()?.to_ascii_uppercase();
        let name = parts.next()?.to_string();

        match verb.as_str() {
            "SEND" => {
                let ip = parts.next()?.parse().ok()?;
                let port = parts.next()?.parse().ok()?;
                let size = parts.next()?.parse().ok()?;
                Some(Dcc::Send {
                    name,
                    ip,
                    port,
                    size,
                })
            }
            "RESUME" => {
                let port = parts.next()?.parse().ok()?;
                let offset = parts.next()?.parse().ok()?;
                Some(Dcc::Resume { name, port, offset })
            }
            "ACCEPT" => {
                let port = parts.next()?.parse().ok()?;
                let offset = parts.next()?.parse().ok()?;
                Some(Dcc::Accept { name, port, offset })
            }
            _ => None,
        }
    }
}

/// 전송용 파일명 정리 (공백은 와이어 토큰을 깨므로 밑줄로 치환)
pub fn sanitize_send_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_whitespace() || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// 누적 바이트 ACK 직렬화 (4바이트 big-endian, 32비트로 절단)
pub fn ack_to_bytes(bytes_got: u64) -> [u8; 4] {
    (bytes_got as u32).to_be_bytes()
}

/// 누적 바이트 ACK 역직렬화
pub fn ack_from_bytes(raw: [u8; 4]) -> u32 {
    u32::from_be_bytes(raw)
}

/// 호스트마스크 와일드카드 매칭 (`*` = 임의 문자열, `?` = 임의 한 글자)
///
/// 대소문자 구분 없음.
pub fn hostmask_matches(pattern: &str, hostmask: &str) -> bool {
    fn inner(p: &[u8], h: &[u8]) -> bool {
        match (p.first(), h.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], h) || (!h.is_empty() && inner(p, &h[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &h[1..]),
            (Some(&pc), Some(&hc)) => {
                pc.to_ascii_lowercase() == hc.to_ascii_lowercase() && inner(&p[1..], &h[1..])
            }
            _ => false,
        }
    }
    inner(pattern.as_bytes(), hostmask.as_bytes())
}

/// 패턴 목록 검사. 비어 있으면 `empty_allows`를 반환
pub fn verify_host(patterns: &[String], hostmask: &str, empty_allows: bool) -> bool {
    if patterns.is_empty() {
        return empty_allows;
    }
    patterns.iter().any(|p| hostmask_matches(p, hostmask))
}

/// 사람이 읽는 크기 문자열 ("12.3M" 식, 알림 텍스트용)
pub fn size_str(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["", "K", "M", "G", "T"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[unit])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_format() {
        let offer = Dcc::Send {
            name: "big_file.tar".into(),
            ip: 3232235777, // 192.168.1.1
            port: 40123,
            size: 1_048_576,
        };

        assert_eq!(
            offer.to_wire(),
            "\x01DCC SEND big_file.tar 3232235777 40123 1048576\x01"
        );
        assert_eq!(Dcc::parse(&offer.to_wire()), Some(offer));
    }

    #[test]
    fn test_resume_accept_roundtrip() {
        let resume = Dcc::Resume {
            name: "big_file.tar".into(),
            port: 40123,
            offset: 524_288,
        };
        assert_eq!(
            resume.to_wire(),
            "\x01DCC RESUME big_file.tar 40123 524288\x01"
        );

        let accept = Dcc::Accept {
            name: "big_file.tar".into(),
            port: 40123,
            offset: 524_288,
        };
        assert_eq!(Dcc::parse(&accept.to_wire()), Some(accept));
    }

    #[test]
    fn test_parse_without_markers() {
        let parsed = Dcc::parse("DCC RESUME file.bin 5000 100");
        assert_eq!(
            parsed,
            Some(Dcc::Resume {
                name: "file.bin".into(),
                port: 5000,
                offset: 100,
            })
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Dcc::parse("DCC SEND file.bin notanip 1 2"), None);
        assert_eq!(Dcc::parse("XDCC SEND #1"), None);
        assert_eq!(Dcc::parse("DCC"), None);
    }

    #[test]
    fn test_sanitize_send_name() {
        assert_eq!(sanitize_send_name("my file (1).bin"), "my_file_(1).bin");
        assert_eq!(sanitize_send_name("clean.bin"), "clean.bin");
    }

    #[test]
    fn test_ack_bytes() {
        assert_eq!(ack_to_bytes(0x01020304), [1, 2, 3, 4]);
        assert_eq!(ack_from_bytes([0, 0x10, 0, 0]), 0x0010_0000);
        // 4GB 초과는 32비트로 절단
        assert_eq!(ack_to_bytes(0x1_0000_0001), [0, 0, 0, 1]);
    }

    #[test]
    fn test_hostmask_wildcards() {
        assert!(hostmask_matches("*!*@*.example.com", "nick!user@host.example.com"));
        assert!(hostmask_matches("NICK!*@*", "nick!user@anywhere"));
        assert!(!hostmask_matches("*!*@*.example.com", "nick!user@evil.org"));
        assert!(hostmask_matches("n?ck!*@*", "nick!u@h"));
    }

    #[test]
    fn test_verify_host_empty_policy() {
        assert!(verify_host(&[], "a!b@c", true));
        assert!(!verify_host(&[], "a!b@c", false));
    }

    #[test]
    fn test_size_str() {
        assert_eq!(size_str(512), "512");
        assert_eq!(size_str(1536), "1.5K");
        assert_eq!(size_str(1_048_576), "1.0M");
    }
}
