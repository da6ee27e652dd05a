//! 승인 컨트롤러
//!
//! 요청 하나를 게이트 순서대로 판정해 즉시 전송 / 대기열 / 거부를 결정한다.
//! 첫 매칭 게이트에서 끝나며, 뒤 게이트는 평가되지 않는다.
//! 모든 거부는 사람이 읽는 사유 문자열로 끝나고 에러가 아니다.

use crate::config::Config;
use crate::governor::TransferLimits;
use crate::message::{size_str, verify_host};
use crate::pack::{PackCatalog, PackId};
use crate::registry::{QueueEntry, SessionRegistry};

/// 판정 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// 즉시 전송 수락
    Accepted { pack_id: PackId },

    /// 대기열 등록 (등록 알림 포함)
    Queued(String),

    /// 거부 (사유 알림 포함)
    Denied(String),
}

/// 대기열 승격 호출자 구분
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteMode {
    /// 슬롯이 비어 자동 승격
    SlotFreed,

    /// 저대역폭 기회 승격
    LowBandwidth,

    /// 운영자 수동 승격 (1인당 상한 무시)
    Manual,
}

/// 판정에 필요한 읽기 문맥
pub struct AdmissionCtx<'a> {
    pub catalog: &'a PackCatalog,
    pub limits: &'a TransferLimits,
    pub config: &'a Config,

    /// 현재 시각 (epoch 초)
    pub now: u64,

    /// 신규 연결 일시 중지 해제 시각 (epoch 초, 0이면 비활성)
    pub no_new_until: u64,

    /// 요청자가 알려진 멤버인지 (restrict_send 판정용)
    pub known_member: bool,
}

/// 전송 요청 판정
///
/// 게이트 순서: 호스트 → 멤버 제한 → 팩 번호 → 중복 → 일시 중지 →
/// 전송량 한도 → 1인당 상한(대기열 위임) → 슬롯(대기열 위임) → 수락
pub fn request_transfer(
    ctx: &AdmissionCtx<'_>,
    registry: &mut SessionRegistry,
    nick: &str,
    hostname: &str,
    hostmask: &str,
    pack_number: usize,
) -> Admission {
    if !verify_host(&ctx.config.download_hosts, hostmask, true) {
        return Admission::Denied(format!(
            "** XDCC SEND denied, I don't send transfers to {}",
            hostmask
        ));
    }

    if ctx.config.restrict_send && !ctx.known_member {
        return Admission::Denied(
            "** XDCC SEND denied, you must be on a known channel to request a pack".into(),
        );
    }

    let pack = match ctx.catalog.by_number(pack_number) {
        Some(pack) => pack,
        None => return Admission::Denied("** Invalid Pack Number, Try Again".into()),
    };

    if registry.host_has_pack_active(hostname, pack.id) {
        return Admission::Denied("** You already requested that pack".into());
    }

    if ctx.no_new_until > ctx.now {
        let minutes = (ctx.no_new_until - ctx.now + 1) / 60;
        return Admission::Denied(format!(
            "** The Owner Has Requested That No New Connections Are Made In The Next {} Minute{}",
            minutes,
            if minutes != 1 { "s" } else { "" }
        ));
    }

    if ctx.limits.is_over() {
        let reason = ctx
            .limits
            .deny_message()
            .unwrap_or_else(|| "** Sorry, I have exceeded my transfer limit.".into());
        return Admission::Denied(reason);
    }

    let active_for_host = registry.active_for_host(hostname);
    if active_for_host >= ctx.config.max_transfers_per_person {
        let cap = ctx.config.max_transfers_per_person;
        let (added, detail) = enqueue(ctx, registry, nick, hostname, pack.id);
        let text = format!(
            "** You can only have {} transfer{} at a time, {}",
            cap,
            if cap != 1 { "s" } else { "" },
            detail
        );
        return if added {
            Admission::Queued(text)
        } else {
            Admission::Denied(text)
        };
    }

    if slots_full(ctx, registry, pack.size) {
        let (added, detail) = enqueue(ctx, registry, nick, hostname, pack.id);
        let text = format!("** All Slots Full, {}", detail);
        return if added {
            Admission::Queued(text)
        } else {
            Admission::Denied(text)
        };
    }

    Admission::Accepted { pack_id: pack.id }
}

/// 전역 슬롯 소진 판정 (소형 파일 우회 포함)
fn slots_full(ctx: &AdmissionCtx<'_>, registry: &SessionRegistry, pack_size: u64) -> bool {
    let active = registry.active_transfers();

    if active >= ctx.config.hard_slot_cap {
        return true;
    }

    let small = ctx.config.small_file_bypass != 0 && pack_size < ctx.config.small_file_bypass;
    if small {
        // 소형 파일은 절대 상한까지만 본다
        return false;
    }

    active >= ctx.config.slots_max
}

/// 대기열 등록 시도
///
/// 반환: (등록 여부, 상세 메시지). 등록 실패 시에도 항목은 만들지 않는다.
pub fn enqueue(
    ctx: &AdmissionCtx<'_>,
    registry: &mut SessionRegistry,
    nick: &str,
    hostname: &str,
    pack_id: PackId,
) -> (bool, String) {
    if registry.host_has_pack_queued(hostname, pack_id) {
        return (
            false,
            "Denied, You already have that item queued.".to_string(),
        );
    }

    let in_queue = registry.queued_for_host(hostname);
    if in_queue >= ctx.config.max_queued_per_person {
        return (
            false,
            format!(
                "Denied, You already have {} items queued, Try Again Later",
                in_queue
            ),
        );
    }

    if registry.queue.len() >= ctx.config.queue_size {
        return (
            false,
            format!(
                "Main queue of size {} is Full, Try Again Later",
                ctx.config.queue_size
            ),
        );
    }

    registry.queue.push_back(QueueEntry {
        nick: nick.to_string(),
        hostname: hostname.to_string(),
        pack_id,
        queued_at: ctx.now,
    });

    (
        true,
        format!(
            "Added you to the main queue in position {}. Type \"xdcc remove\" to remove yourself at a later time.",
            registry.queue.len()
        ),
    )
}

/// 팩 정보 조회 판정 (게이트 1~3만 적용)
pub fn request_info(
    ctx: &AdmissionCtx<'_>,
    hostmask: &str,
    pack_number: usize,
) -> Result<Vec<String>, String> {
    if !verify_host(&ctx.config.download_hosts, hostmask, true) {
        return Err(format!(
            "** XDCC INFO denied, I don't send transfers to {}",
            hostmask
        ));
    }

    if ctx.config.restrict_send && !ctx.known_member {
        return Err(
            "** XDCC INFO denied, you must be on a known channel to request pack info".into(),
        );
    }

    let pack = match ctx.catalog.by_number(pack_number) {
        Some(pack) => pack,
        None => return Err("** Invalid Pack Number, Try Again".into()),
    };

    let mut lines = vec![
        format!("Pack Info for Pack #{}:", pack_number),
        format!(" Filename       {}", pack.send_name()),
    ];
    if pack.send_name() != pack.desc {
        lines.push(format!(" Description    {}", pack.desc));
    }
    if !pack.note.is_empty() {
        lines.push(format!(" Note           {}", pack.note));
    }
    lines.push(format!(
        " Filesize       {} [{}B]",
        pack.size,
        size_str(pack.size)
    ));
    lines.push(format!(" Gets           {}", pack.gets));
    if pack.min_speed_kbs > 0.0 {
        lines.push(format!(" Minspeed       {:.1}KB/sec", pack.min_speed_kbs));
    }
    if pack.max_speed_kbs > 0.0 {
        lines.push(format!(" Maxspeed       {:.1}KB/sec", pack.max_speed_kbs));
    }
    if let Some(crc) = pack.checksum {
        lines.push(format!(" crc32          {:08X}", crc));
    }

    Ok(lines)
}

/// 대기열 승격: 다음 적격 항목을 꺼낸다
///
/// `Manual`은 머리 항목을 무조건 꺼내고, 나머지 모드는 1인당 상한에
/// 걸린 항목을 (제거하지 않고) 건너뛴 뒤 첫 적격 항목을 꺼낸다.
pub fn promote_queue(
    registry: &mut SessionRegistry,
    config: &Config,
    mode: PromoteMode,
) -> Option<QueueEntry> {
    if registry.queue.is_empty() {
        return None;
    }

    if mode == PromoteMode::Manual {
        return registry.queue.pop_front();
    }

    let eligible = registry.queue.iter().position(|entry| {
        registry
            .transfers
            .iter()
            .filter(|t| {
                t.status != crate::transfer::TransferStatus::Done
                    && t.hostname == entry.hostname
            })
            .count()
            < config.max_transfers_per_person
    })?;

    registry.queue.remove(eligible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferSession;
    use std::io::Write;

    struct Fixture {
        catalog: PackCatalog,
        limits: TransferLimits,
        config: Config,
        registry: SessionRegistry,
        _files: Vec<tempfile::NamedTempFile>,
    }

    fn fixture(pack_sizes: &[usize]) -> Fixture {
        let mut catalog = PackCatalog::new();
        let mut files = Vec::new();
        for (i, &len) in pack_sizes.iter().enumerate() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(&vec![0u8; len]).unwrap();
            file.flush().unwrap();
            catalog
                .add(file.path().into(), format!("pack-{}", i + 1))
                .unwrap();
            files.push(file);
        }

        Fixture {
            catalog,
            limits: TransferLimits::new([0, 0, 0]),
            config: Config::new(),
            registry: SessionRegistry::new(),
            _files: files,
        }
    }

    fn ctx<'a>(fx: &'a Fixture) -> AdmissionCtx<'a> {
        AdmissionCtx {
            catalog: &fx.catalog,
            limits: &fx.limits,
            config: &fx.config,
            now: 10_000,
            no_new_until: 0,
            known_member: true,
        }
    }

    /// 판정 헬퍼: 문맥은 호출 안에서 구성 (레지스트리와 분리 차용)
    fn decide(
        fx: &mut Fixture,
        no_new_until: u64,
        known_member: bool,
        hostname: &str,
        pack: usize,
    ) -> Admission {
        let ctx = AdmissionCtx {
            catalog: &fx.catalog,
            limits: &fx.limits,
            config: &fx.config,
            now: 10_000,
            no_new_until,
            known_member,
        };
        request_transfer(&ctx, &mut fx.registry, "nick", hostname, "nick!u@h", pack)
    }

    fn request(fx: &mut Fixture, hostname: &str, pack: usize) -> Admission {
        decide(fx, 0, true, hostname, pack)
    }

    fn enq(fx: &mut Fixture, nick: &str, hostname: &str, pack_id: PackId) -> (bool, String) {
        let ctx = AdmissionCtx {
            catalog: &fx.catalog,
            limits: &fx.limits,
            config: &fx.config,
            now: 10_000,
            no_new_until: 0,
            known_member: true,
        };
        enqueue(&ctx, &mut fx.registry, nick, hostname, pack_id)
    }

    fn active_session(fx: &Fixture, hostname: &str, pack_number: usize) -> TransferSession {
        let pack_id = fx.catalog.by_number(pack_number).unwrap().id;
        TransferSession::new(99, "nick", hostname, pack_id, 0)
    }

    #[test]
    fn test_gate_host_denied() {
        let mut fx = fixture(&[100]);
        fx.config.download_hosts = vec!["*!*@trusted.net".into()];

        match request(&mut fx, "h", 1) {
            Admission::Denied(msg) => {
                assert_eq!(msg, "** XDCC SEND denied, I don't send transfers to nick!u@h")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_gate_restricted() {
        let mut fx = fixture(&[100]);
        fx.config.restrict_send = true;

        match decide(&mut fx, 0, false, "h", 1) {
            Admission::Denied(msg) => assert!(msg.contains("known channel")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_gate_bad_pack_number() {
        let mut fx = fixture(&[100]);

        for bad in [0usize, 2, 99] {
            match request(&mut fx, "h", bad) {
                Admission::Denied(msg) => {
                    assert_eq!(msg, "** Invalid Pack Number, Try Again")
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_gate_duplicate_request() {
        let mut fx = fixture(&[100]);
        let session = active_session(&fx, "host-a", 1);
        fx.registry.transfers.push(session);
        // 중복 게이트가 1인당 상한 게이트보다 먼저다
        fx.config.max_transfers_per_person = 1;

        match request(&mut fx, "host-a", 1) {
            Admission::Denied(msg) => assert_eq!(msg, "** You already requested that pack"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_gate_paused_with_minutes() {
        let mut fx = fixture(&[100]);

        match decide(&mut fx, 10_000 + 600, true, "h", 1) {
            Admission::Denied(msg) => {
                assert!(msg.contains("No New Connections"));
                assert!(msg.contains("10 Minutes"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_gate_transfer_limit() {
        let mut fx = fixture(&[100]);
        fx.limits = TransferLimits::new([50, 0, 0]);
        let now = chrono::Local::now();
        fx.limits.sweep(now);
        fx.limits.record(60);
        fx.limits.sweep(now);

        match request(&mut fx, "h", 1) {
            Admission::Denied(msg) => assert!(msg.contains("transfer limit")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_gate_person_cap_queues() {
        let mut fx = fixture(&[100, 100]);
        let session = active_session(&fx, "host-a", 1);
        fx.registry.transfers.push(session);

        // 다른 팩 요청이라 중복이 아니고, 1인당 상한에 걸려 대기열로
        match request(&mut fx, "host-a", 2) {
            Admission::Queued(msg) => {
                assert!(msg.starts_with("** You can only have 1 transfer at a time"));
                assert!(msg.contains("position 1"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(fx.registry.queue.len(), 1);
    }

    #[test]
    fn test_gate_slots_full_queues() {
        let mut fx = fixture(&[100, 100]);
        fx.config.slots_max = 1;
        let session = active_session(&fx, "host-other", 1);
        fx.registry.transfers.push(session);

        match request(&mut fx, "host-a", 2) {
            Admission::Queued(msg) => assert!(msg.starts_with("** All Slots Full,")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_small_file_bypass() {
        let mut fx = fixture(&[100, 2_000_000]);
        fx.config.slots_max = 1;
        fx.config.small_file_bypass = 1024;
        let session = active_session(&fx, "host-other", 2);
        fx.registry.transfers.push(session);

        // 소형 팩(1번)은 슬롯이 차도 수락
        match request(&mut fx, "host-a", 1) {
            Admission::Accepted { .. } => {}
            other => panic!("unexpected: {:?}", other),
        }

        // 대형 팩(2번)은 대기열로
        match request(&mut fx, "host-b", 2) {
            Admission::Queued(_) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_accept_happy_path() {
        let mut fx = fixture(&[100]);
        let expect = fx.catalog.by_number(1).unwrap().id;

        assert_eq!(
            request(&mut fx, "h", 1),
            Admission::Accepted { pack_id: expect }
        );
    }

    #[test]
    fn test_enqueue_denials() {
        let mut fx = fixture(&[100, 100, 100, 100]);
        fx.config.max_queued_per_person = 2;
        fx.config.queue_size = 3;
        let ids: Vec<PackId> = (1..=4)
            .map(|n| fx.catalog.by_number(n).unwrap().id)
            .collect();

        assert!(enq(&mut fx, "n", "host-a", ids[0]).0);

        // 같은 팩 중복
        let (added, msg) = enq(&mut fx, "n", "host-a", ids[0]);
        assert!(!added);
        assert_eq!(msg, "Denied, You already have that item queued.");

        assert!(enq(&mut fx, "n", "host-a", ids[1]).0);

        // 1인당 대기열 상한
        let (added, msg) = enq(&mut fx, "n", "host-a", ids[2]);
        assert!(!added);
        assert_eq!(msg, "Denied, You already have 2 items queued, Try Again Later");

        // 전역 대기열 포화
        assert!(enq(&mut fx, "n", "host-b", ids[2]).0);
        let (added, msg) = enq(&mut fx, "n", "host-c", ids[3]);
        assert!(!added);
        assert_eq!(msg, "Main queue of size 3 is Full, Try Again Later");
        assert_eq!(fx.registry.queue.len(), 3);
    }

    #[test]
    fn test_promote_fifo_skips_capped() {
        let mut fx = fixture(&[100, 100, 100]);
        let ids: Vec<PackId> = (1..=3)
            .map(|n| fx.catalog.by_number(n).unwrap().id)
            .collect();

        // host-a가 먼저 줄을 섰지만 이미 상한까지 전송 중
        enq(&mut fx, "a", "host-a", ids[0]);
        enq(&mut fx, "b", "host-b", ids[1]);
        enq(&mut fx, "c", "host-c", ids[2]);
        let session = active_session(&fx, "host-a", 2);
        fx.registry.transfers.push(session);

        // host-a는 건너뛰되 대기열에 남는다
        let entry = promote_queue(&mut fx.registry, &fx.config, PromoteMode::SlotFreed).unwrap();
        assert_eq!(entry.hostname, "host-b");
        assert_eq!(fx.registry.queue.len(), 2);
        assert_eq!(fx.registry.queue[0].hostname, "host-a");

        let entry = promote_queue(&mut fx.registry, &fx.config, PromoteMode::SlotFreed).unwrap();
        assert_eq!(entry.hostname, "host-c");

        // 상한에 걸린 항목만 남으면 아무도 안 나온다
        assert!(promote_queue(&mut fx.registry, &fx.config, PromoteMode::SlotFreed).is_none());
        assert_eq!(fx.registry.queue.len(), 1);

        // 수동 승격은 상한을 무시하고 머리를 꺼낸다
        let entry = promote_queue(&mut fx.registry, &fx.config, PromoteMode::Manual).unwrap();
        assert_eq!(entry.hostname, "host-a");
    }

    #[test]
    fn test_promote_fifo_order() {
        let mut fx = fixture(&[100, 100, 100]);
        let ids: Vec<PackId> = (1..=3)
            .map(|n| fx.catalog.by_number(n).unwrap().id)
            .collect();

        enq(&mut fx, "a", "host-a", ids[0]);
        enq(&mut fx, "b", "host-b", ids[1]);
        enq(&mut fx, "c", "host-c", ids[2]);

        let order: Vec<String> = std::iter::from_fn(|| {
            promote_queue(&mut fx.registry, &fx.config, PromoteMode::SlotFreed)
                .map(|e| e.hostname)
        })
        .collect();

        assert_eq!(order, vec!["host-a", "host-b", "host-c"]);
    }

    #[test]
    fn test_request_info_gates_and_lines() {
        let mut fx = fixture(&[4096]);
        {
            let pack = fx.catalog.by_id_mut(1).unwrap();
            pack.note = "weekly build".into();
            pack.checksum = Some(0xCAFE_F00D);
            pack.gets = 7;
        }
        let c = ctx(&fx);

        let lines = request_info(&c, "nick!u@h", 1).unwrap();
        assert_eq!(lines[0], "Pack Info for Pack #1:");
        assert!(lines.iter().any(|l| l.contains("Note           weekly build")));
        assert!(lines.iter().any(|l| l.contains("Gets           7")));
        assert!(lines.iter().any(|l| l.contains("CAFEF00D")));

        assert!(request_info(&c, "nick!u@h", 9).is_err());

        fx.config.download_hosts = vec!["*!*@elsewhere".into()];
        let c = ctx(&fx);
        let err = request_info(&c, "nick!u@h", 1).unwrap_err();
        assert!(err.contains("XDCC INFO denied"));
    }
}
