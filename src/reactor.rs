//! 리액터 엔진
//!
//! 단일 태스크가 모든 세션/카탈로그/대기열 상태를 소유하고,
//! 250ms 틱과 명령 채널을 `select!`로 다중화한다. 소켓별 블로킹 지점
//! (리슨 수락, 아웃바운드 연결)은 보조 태스크가 맡아 완료를 명령으로
//! 되돌려 보낸다. 판정과 상태 변경은 전부 이 태스크 안에서만 일어난다.
//!
//! 세션 단위 I/O 에러는 해당 세션만 닫고, 루프 자체는 절대 풀리지 않는다.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use chrono::Local;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admission::{self, Admission, AdmissionCtx, PromoteMode};
use crate::checksum::{ChecksumBuilder, ChecksumStep};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::governor::{RateSchedule, SentWindow, TransferLimits};
use crate::message::{size_str, verify_host, Dcc};
use crate::pack::{PackCatalog, PackId};
use crate::registry::{QueueEntry, SessionRegistry, TransferSnapshot, UploadSnapshot};
use crate::state::SavedState;
use crate::stats::GlobalStats;
use crate::transfer::{TransferSession, TransferStatus};
use crate::upload::{Establish, UploadSession, UploadStatus};
use crate::{BUFFER_SIZE, TICK_MS};

/// 채팅 계층으로 내보내는 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// 일반 알림 (NOTICE)
    Notice { nick: String, text: String },

    /// CTCP 페이로드 (DCC 제안/승인 등)
    Ctcp { nick: String, text: String },
}

/// 엔진 명령
#[derive(Debug)]
pub enum EngineCmd {
    RequestTransfer {
        nick: String,
        hostname: String,
        hostmask: String,
        pack_number: usize,
        /// 자동 전송 트리거가 쓰는 맞춤 알림 접두 (None이면 기본 문구)
        custom_notice: Option<String>,
    },
    RequestInfo {
        nick: String,
        hostmask: String,
        pack_number: usize,
    },
    PromoteQueue {
        mode: PromoteMode,
    },
    AcceptUpload {
        nick: String,
        hostname: String,
        hostmask: String,
        filename: String,
        ip: u32,
        port: u16,
        size: u64,
    },
    /// 상대가 우리 송신의 재개를 요청함 (DCC RESUME)
    ResumeRequest {
        nick: String,
        filename: String,
        port: u16,
        offset: u64,
    },
    /// 상대가 우리 업로드 재개 요청을 승인함 (DCC ACCEPT)
    ResumeAck {
        nick: String,
        port: u16,
    },
    RemoveFromQueue {
        nick: String,
    },
    AddPack {
        file: PathBuf,
        desc: String,
    },
    RemovePack {
        number: usize,
    },
    CloseTransfer {
        id: u32,
        reason: String,
    },
    DisableSpeedCap {
        id: u32,
    },
    PauseNewConnections {
        secs: u64,
    },
    SetMembers {
        members: HashSet<String>,
    },
    MemberJoined {
        nick: String,
    },
    MemberLeft {
        nick: String,
    },
    /// 리슨 수락 태스크의 완료 통지
    PeerConnected {
        id: u32,
        stream: TcpStream,
    },
    /// 업로드 연결 태스크의 완료 통지
    UploadConnected {
        id: u32,
        result: std::io::Result<TcpStream>,
    },
    Shutdown,
}

/// 읽기 전용 스냅샷 (리스팅 명령이 엔진 밖에서 소비)
#[derive(Debug, Default)]
pub struct Snapshots {
    pub transfers: DashMap<u32, TransferSnapshot>,
    pub uploads: DashMap<u32, UploadSnapshot>,
    pub queue: RwLock<Vec<QueueEntry>>,
    pub stats: RwLock<GlobalStats>,
}

/// 엔진 핸들 (복제 가능, 명령 송신 + 스냅샷 조회)
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    snapshots: Arc<Snapshots>,
}

impl EngineHandle {
    fn send(&self, cmd: EngineCmd) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn request_transfer(
        &self,
        nick: &str,
        hostname: &str,
        hostmask: &str,
        pack: usize,
        custom_notice: Option<&str>,
    ) {
        self.send(EngineCmd::RequestTransfer {
            nick: nick.into(),
            hostname: hostname.into(),
            hostmask: hostmask.into(),
            pack_number: pack,
            custom_notice: custom_notice.map(|s| s.to_string()),
        });
    }

    pub fn request_info(&self, nick: &str, hostmask: &str, pack: usize) {
        self.send(EngineCmd::RequestInfo {
            nick: nick.into(),
            hostmask: hostmask.into(),
            pack_number: pack,
        });
    }

    pub fn promote_queue(&self, mode: PromoteMode) {
        self.send(EngineCmd::PromoteQueue { mode });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn accept_upload(
        &self,
        nick: &str,
        hostname: &str,
        hostmask: &str,
        filename: &str,
        ip: u32,
        port: u16,
        size: u64,
    ) {
        self.send(EngineCmd::AcceptUpload {
            nick: nick.into(),
            hostname: hostname.into(),
            hostmask: hostmask.into(),
            filename: filename.into(),
            ip,
            port,
            size,
        });
    }

    pub fn resume_request(&self, nick: &str, filename: &str, port: u16, offset: u64) {
        self.send(EngineCmd::ResumeRequest {
            nick: nick.into(),
            filename: filename.into(),
            port,
            offset,
        });
    }

    pub fn resume_ack(&self, nick: &str, port: u16) {
        self.send(EngineCmd::ResumeAck {
            nick: nick.into(),
            port,
        });
    }

    pub fn remove_from_queue(&self, nick: &str) {
        self.send(EngineCmd::RemoveFromQueue { nick: nick.into() });
    }

    pub fn add_pack(&self, file: PathBuf, desc: &str) {
        self.send(EngineCmd::AddPack {
            file,
            desc: desc.into(),
        });
    }

    pub fn remove_pack(&self, number: usize) {
        self.send(EngineCmd::RemovePack { number });
    }

    pub fn close_transfer(&self, id: u32, reason: &str) {
        self.send(EngineCmd::CloseTransfer {
            id,
            reason: reason.into(),
        });
    }

    pub fn disable_speed_cap(&self, id: u32) {
        self.send(EngineCmd::DisableSpeedCap { id });
    }

    pub fn pause_new_connections(&self, secs: u64) {
        self.send(EngineCmd::PauseNewConnections { secs });
    }

    pub fn set_members(&self, members: HashSet<String>) {
        self.send(EngineCmd::SetMembers { members });
    }

    pub fn member_joined(&self, nick: &str) {
        self.send(EngineCmd::MemberJoined { nick: nick.into() });
    }

    pub fn member_left(&self, nick: &str) {
        self.send(EngineCmd::MemberLeft { nick: nick.into() });
    }

    pub fn shutdown(&self) {
        self.send(EngineCmd::Shutdown);
    }

    /// 송신 세션 스냅샷
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        self.snapshots
            .transfers
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// 업로드 세션 스냅샷
    pub fn uploads(&self) -> Vec<UploadSnapshot> {
        self.snapshots
            .uploads
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// 대기열 스냅샷
    pub fn queue(&self) -> Vec<QueueEntry> {
        self.snapshots.queue.read().clone()
    }

    /// 전역 통계 스냅샷
    pub fn stats(&self) -> GlobalStats {
        self.snapshots.stats.read().clone()
    }
}

/// 틱 경계 플래그 (경계당 정확히 한 번만 참)
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TickFlags {
    pub quarter: bool,
    pub sec: bool,
    pub min: bool,
    pub hour: bool,
}

/// 시계 점프 감지 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClockJump {
    Backward(u64),
    Forward(u64),
}

/// 벽시계 경계 추적
#[derive(Debug)]
pub(crate) struct EngineClock {
    last_quarter_ms: u64,
    last_sec: u64,
    last_min: u64,
    last_hour: u64,
}

impl EngineClock {
    pub(crate) fn new(now_ms: u64) -> Self {
        let now_sec = now_ms / 1000;
        Self {
            last_quarter_ms: now_ms,
            last_sec: now_sec,
            last_min: now_sec / 60,
            last_hour: now_sec / 3600,
        }
    }

    /// 경과 판정. 점프가 있으면 함께 보고
    ///
    /// 쿼터초는 드리프트 없이 250ms씩 전진한다 (대역폭 계산의 전제).
    /// 1초 이상 밀렸거나 시간이 되감기면 기준점을 재설정한다.
    pub(crate) fn advance(&mut self, now_ms: u64) -> (TickFlags, Option<ClockJump>) {
        let mut flags = TickFlags::default();
        let now_sec = now_ms / 1000;

        if now_ms > self.last_quarter_ms + 1000 || now_ms < self.last_quarter_ms {
            self.last_quarter_ms = now_ms.saturating_sub(250);
        }
        if now_ms >= self.last_quarter_ms + 250 {
            flags.quarter = true;
            self.last_quarter_ms += 250;
        }

        let mut jump = None;
        if now_sec != self.last_sec {
            if now_sec + 3 < self.last_sec {
                jump = Some(ClockJump::Backward(self.last_sec - now_sec));
            } else if now_sec > self.last_sec + 10 {
                jump = Some(ClockJump::Forward(now_sec - self.last_sec));
            }
            flags.sec = true;
            self.last_sec = now_sec;
        }

        if flags.sec && now_sec / 60 != self.last_min {
            flags.min = true;
            self.last_min = now_sec / 60;
        }
        if flags.sec && now_sec / 3600 != self.last_hour {
            flags.hour = true;
            self.last_hour = now_sec / 3600;
        }

        (flags, jump)
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn caps(nick: &str) -> String {
    nick.to_uppercase()
}

/// 전송 엔진
pub struct Engine {
    config: Config,
    catalog: PackCatalog,
    registry: SessionRegistry,
    limits: TransferLimits,
    sent: SentWindow,
    stats: GlobalStats,

    /// 현재 유효한 전역 상한 (시간별 재계산)
    max_kbs: u32,

    /// 신규 연결 일시 중지 해제 시각 (epoch 초)
    no_new_until: u64,

    /// 알려진 멤버 (정규화된 닉)
    members: HashSet<String>,

    /// 진행 중인 백그라운드 체크섬
    checksum: Option<ChecksumBuilder>,

    /// 공용 송수신 버퍼
    buf: BytesMut,

    clock: EngineClock,
    last_4sec: u64,
    last_20sec: u64,
    last_3min: u64,

    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCmd>,
    chat_tx: mpsc::UnboundedSender<ChatEvent>,
    persist_tx: mpsc::UnboundedSender<Vec<u8>>,
    snapshots: Arc<Snapshots>,
}

impl Engine {
    /// 엔진 생성
    ///
    /// 반환: (엔진, 핸들, 채팅 이벤트 수신기, 상태 저장 페이로드 수신기)
    pub fn new(
        config: Config,
        catalog: PackCatalog,
    ) -> (
        Self,
        EngineHandle,
        mpsc::UnboundedReceiver<ChatEvent>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let snapshots = Arc::new(Snapshots::default());

        let now_ms = unix_ms();
        let now_sec = now_ms / 1000;
        let limits = TransferLimits::new(config.transfer_limits);

        let handle = EngineHandle {
            cmd_tx: cmd_tx.clone(),
            snapshots: Arc::clone(&snapshots),
        };

        let engine = Self {
            max_kbs: config.overall_max_kbs,
            config,
            catalog,
            registry: SessionRegistry::new(),
            limits,
            sent: SentWindow::new(),
            stats: GlobalStats::new(),
            no_new_until: 0,
            members: HashSet::new(),
            checksum: None,
            buf: BytesMut::zeroed(BUFFER_SIZE),
            clock: EngineClock::new(now_ms),
            last_4sec: now_sec,
            last_20sec: now_sec,
            last_3min: now_sec,
            cmd_tx,
            cmd_rx,
            chat_tx,
            persist_tx,
            snapshots,
        };

        (engine, handle, chat_rx, persist_rx)
    }

    /// 메인 루프: 틱/명령 다중화 + 주기 사다리
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.recompute_max_kbs();
        self.limits.sweep(Local::now());
        info!(
            "engine started: {} packs, {} slots, cap {} KB/s",
            self.catalog.len(),
            self.config.slots_max,
            self.max_kbs,
        );

        loop {
            let mut stop = false;

            tokio::select! {
                _ = tick.tick() => {}
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(EngineCmd::Shutdown) => stop = true,
                    Some(cmd) => self.handle_cmd(cmd).await,
                }
            }

            if stop {
                self.shutdown();
                break;
            }

            self.pass().await;
        }
    }

    /// 한 번의 리액터 패스
    async fn pass(&mut self) {
        let now_ms = unix_ms();
        let now = now_ms / 1000;
        let (flags, jump) = self.clock.advance(now_ms);

        match jump {
            Some(ClockJump::Backward(secs)) => {
                warn!("system time changed backwards {}m {}s", secs / 60, secs % 60);
            }
            Some(ClockJump::Forward(secs)) => {
                warn!(
                    "system time changed forward or mainloop skipped {}m {}s",
                    secs / 60,
                    secs % 60
                );
            }
            None => {}
        }

        if flags.quarter {
            self.refill_buckets();
            self.drain_transfer_acks(now);
            self.service_transfers(now);
            self.service_uploads(now);
        }

        // 체크섬은 전송을 굶기지 않도록 매 패스 한 스텝만
        self.step_checksum();

        if flags.sec {
            self.second_pass(now).await;
        }

        if flags.min && self.config.restrict_send {
            self.reverify_restricted_queue();
        }

        if flags.hour {
            self.recompute_max_kbs();
        }
    }

    /// 1초 주기 사다리
    async fn second_pass(&mut self, now: u64) {
        self.stats.uptime_secs += 1;
        let aggregate = self.sent.recent_kbs(now);
        self.stats.note_aggregate_speed(aggregate);
        self.sent.rotate(now);

        self.transfer_liveness(now);
        self.upload_liveness(now);
        self.reap_and_promote(now).await;
        self.sweep_limits(now);
        self.schedule_checksum();

        if now.saturating_sub(self.last_4sec) > 3 {
            let dt = Duration::from_secs(now - self.last_4sec);
            self.update_speeds(now, dt);
            self.last_4sec = now;
        }

        if now.saturating_sub(self.last_20sec) > 19 {
            self.rescan_catalog();
            self.last_20sec = now;
        }

        if now.saturating_sub(self.last_3min) > 179 {
            self.low_bandwidth_pump(now);
            self.persist();
            self.last_3min = now;
        }

        self.publish_snapshots();
    }

    // ───────────────────────── 명령 처리 ─────────────────────────

    async fn handle_cmd(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::RequestTransfer {
                nick,
                hostname,
                hostmask,
                pack_number,
                custom_notice,
            } => {
                self.on_request_transfer(
                    &nick,
                    &hostname,
                    &hostmask,
                    pack_number,
                    custom_notice.as_deref(),
                )
                .await;
            }
            EngineCmd::RequestInfo {
                nick,
                hostmask,
                pack_number,
            } => {
                self.on_request_info(&nick, &hostmask, pack_number);
            }
            EngineCmd::PromoteQueue { mode } => {
                self.promote_one(mode).await;
            }
            EngineCmd::AcceptUpload {
                nick,
                hostname,
                hostmask,
                filename,
                ip,
                port,
                size,
            } => {
                self.on_accept_upload(&nick, &hostname, &hostmask, &filename, ip, port, size);
            }
            EngineCmd::ResumeRequest {
                nick,
                filename,
                port,
                offset,
            } => {
                self.on_resume_request(&nick, &filename, port, offset);
            }
            EngineCmd::ResumeAck { nick, port } => {
                self.on_resume_ack(&nick, port);
            }
            EngineCmd::RemoveFromQueue { nick } => {
                let nick_caps = caps(&nick);
                let before = self.registry.queue.len();
                self.registry.queue.retain(|q| caps(&q.nick) != nick_caps);
                if self.registry.queue.len() != before {
                    self.notice(&nick, "Removed you from the queue".into());
                }
            }
            EngineCmd::AddPack { file, desc } => {
                match self.catalog.add(file, desc) {
                    Ok(id) => {
                        info!("pack {} added ({} total)", id, self.catalog.len());
                        self.persist();
                    }
                    Err(e) => warn!("can't add pack: {}", e),
                }
            }
            EngineCmd::RemovePack { number } => {
                self.on_remove_pack(number);
            }
            EngineCmd::CloseTransfer { id, reason } => {
                if let Some(idx) = self.registry.transfers.iter().position(|t| t.id == id) {
                    self.close_transfer_idx(idx, &reason);
                } else {
                    warn!("close requested for unknown transfer {}", id);
                }
            }
            EngineCmd::DisableSpeedCap { id } => {
                if let Some(tr) = self.registry.transfer_by_id(id) {
                    tr.no_max = true;
                    info!("transfer {}: speed cap disabled", id);
                }
            }
            EngineCmd::PauseNewConnections { secs } => {
                self.no_new_until = unix_ms() / 1000 + secs;
            }
            EngineCmd::SetMembers { members } => {
                self.members = members.into_iter().map(|m| caps(&m)).collect();
            }
            EngineCmd::MemberJoined { nick } => {
                self.members.insert(caps(&nick));
            }
            EngineCmd::MemberLeft { nick } => {
                self.members.remove(&caps(&nick));
            }
            EngineCmd::PeerConnected { id, stream } => {
                self.on_peer_connected(id, stream);
            }
            EngineCmd::UploadConnected { id, result } => {
                self.on_upload_connected(id, result);
            }
            EngineCmd::Shutdown => unreachable!("handled by run()"),
        }
    }

    async fn on_request_transfer(
        &mut self,
        nick: &str,
        hostname: &str,
        hostmask: &str,
        pack_number: usize,
        custom_notice: Option<&str>,
    ) {
        let now = unix_ms() / 1000;
        let decision = {
            let ctx = AdmissionCtx {
                catalog: &self.catalog,
                limits: &self.limits,
                config: &self.config,
                now,
                no_new_until: self.no_new_until,
                known_member: self.members.contains(&caps(nick)),
            };
            admission::request_transfer(&ctx, &mut self.registry, nick, hostname, hostmask, pack_number)
        };

        match decision {
            Admission::Denied(reason) => {
                info!("denied {} ({}): pack {}", nick, hostname, pack_number);
                self.notice(nick, reason);
            }
            Admission::Queued(text) => {
                info!("queued {} ({}): pack {}", nick, hostname, pack_number);
                self.notice(nick, text);
            }
            Admission::Accepted { pack_id } => {
                info!("requested {} ({}): pack {}", nick, hostname, pack_number);
                if !self.config.quiet_mode {
                    if let Some(pack) = self.catalog.by_id(pack_id) {
                        let text = match custom_notice {
                            Some(prefix) => format!(
                                "{} Which Is {}B. (Resume Supported)",
                                prefix,
                                size_str(pack.size),
                            ),
                            None => format!(
                                "** Sending you pack #{} (\"{}\"), which is {}B (resume supported)",
                                pack_number,
                                pack.desc,
                                size_str(pack.size),
                            ),
                        };
                        self.notice(nick, text);
                    }
                }
                self.start_transfer(nick, hostname, pack_id, false).await;
            }
        }
    }

    fn on_request_info(&mut self, nick: &str, hostmask: &str, pack_number: usize) {
        let ctx = AdmissionCtx {
            catalog: &self.catalog,
            limits: &self.limits,
            config: &self.config,
            now: unix_ms() / 1000,
            no_new_until: self.no_new_until,
            known_member: self.members.contains(&caps(nick)),
        };

        match admission::request_info(&ctx, hostmask, pack_number) {
            Ok(lines) => {
                for line in lines {
                    self.notice(nick, line);
                }
            }
            Err(reason) => self.notice(nick, reason),
        }
    }

    /// 수락 공통 경로: 핸들 획득, 리슨 준비, 제안 송신
    async fn start_transfer(&mut self, nick: &str, hostname: &str, pack_id: PackId, from_queue: bool) {
        let (handle, send_name, size) = {
            let pack = match self.catalog.by_id_mut(pack_id) {
                Some(pack) => pack,
                None => {
                    self.notice(nick, "** Invalid Pack Number, Try Again".into());
                    return;
                }
            };

            pack.check_file_changed();

            match pack.acquire_handle() {
                Ok(handle) => (handle, pack.send_name(), pack.size),
                Err(e) => {
                    warn!("pack {}: {}", pack_id, e);
                    self.notice(
                        nick,
                        "** File Error, pack file is not accessible right now".into(),
                    );
                    return;
                }
            }
        };

        let (listener, port) = match self.bind_listener().await {
            Ok(bound) => bound,
            Err(e) => {
                warn!("listen setup failed: {}", e);
                if let Some(pack) = self.catalog.by_id_mut(pack_id) {
                    pack.release_handle();
                }
                self.notice(nick, "** Unable to open a listen port, Try Again Later".into());
                return;
            }
        };

        let now = unix_ms() / 1000;
        let id = self.registry.alloc_id();
        let mut session = TransferSession::new(id, nick, hostname, pack_id, now);
        session.file = Some(handle);
        session.listen_port = port;

        let cmd_tx = self.cmd_tx.clone();
        session.listen_task = Some(tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let _ = cmd_tx.send(EngineCmd::PeerConnected { id, stream });
            }
        }));

        info!(
            "transfer {}: listening on {} for {} ({}), pack {}",
            id, port, nick, hostname, pack_id,
        );

        if from_queue && !self.config.quiet_mode {
            let text = format!(
                "** Sending You Your Queued Pack Which Is {}B. (Resume Supported)",
                size_str(size),
            );
            self.notice(nick, text);
        }

        self.ctcp(
            nick,
            Dcc::Send {
                name: send_name,
                ip: self.config.advertised_ip,
                port,
                size,
            }
            .to_wire(),
        );

        self.registry.transfers.push(session);
    }

    /// 리슨 소켓 바인드 (설정 범위 안에서 포트 선택)
    async fn bind_listener(&self) -> Result<(TcpListener, u16)> {
        let (start, end) = self.config.port_range;

        if start == 0 {
            let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
            let port = listener.local_addr()?.port();
            return Ok((listener, port));
        }

        // 범위 안의 임의 지점에서 출발해 순차 탐색
        let span = (end.max(start) - start) as u32 + 1;
        let offset = rand::thread_rng().gen_range(0..span);
        for i in 0..span.min(64) {
            let port = start + ((offset + i) % span) as u16;
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                return Ok((listener, port));
            }
        }
        Err(Error::NoListenPort { start, end })
    }

    fn on_peer_connected(&mut self, id: u32, stream: TcpStream) {
        let now = unix_ms() / 1000;
        match self
            .registry
            .transfers
            .iter_mut()
            .find(|t| t.id == id && t.status == TransferStatus::Listening)
        {
            Some(tr) => tr.attach_peer(stream, now),
            None => {
                // 세션이 먼저 닫힌 뒤 도착한 늦은 연결
                debug!("stale peer connection for transfer {}", id);
            }
        }
    }

    fn on_resume_request(&mut self, nick: &str, filename: &str, port: u16, offset: u64) {
        let nick_caps = caps(nick);
        let needle = filename.to_lowercase();

        let found = self.registry.transfers.iter().position(|t| {
            t.status == TransferStatus::Listening
                && t.nick_caps == nick_caps
                && (t.listen_port == port
                    || self
                        .catalog
                        .by_id(t.pack_id)
                        .map(|p| p.send_name().to_lowercase().contains(&needle))
                        .unwrap_or(false))
        });

        let idx = match found {
            Some(idx) => idx,
            None => {
                warn!("couldn't find transfer that {} tried to resume", nick);
                return;
            }
        };

        let pack_size = self
            .catalog
            .by_id(self.registry.transfers[idx].pack_id)
            .map(|p| p.size)
            .unwrap_or(0);

        let tr = &mut self.registry.transfers[idx];
        if !tr.set_resume(offset, pack_size) {
            info!(
                "transfer [{:02}:{}]: resume attempted beyond end of file ({} >= {})",
                tr.id, tr.nick, offset, pack_size,
            );
            self.notice(
                nick,
                "You can't resume the transfer at a point greater than the size of the file"
                    .into(),
            );
            return;
        }

        info!(
            "transfer [{:02}:{}]: resumed at {}K",
            tr.id,
            tr.nick,
            tr.start_resume / 1024,
        );
        self.ctcp(
            nick,
            Dcc::Accept {
                name: filename.to_string(),
                port,
                offset,
            }
            .to_wire(),
        );
    }

    // ───────────────────────── 업로드 ─────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn on_accept_upload(
        &mut self,
        nick: &str,
        hostname: &str,
        hostmask: &str,
        filename: &str,
        ip: u32,
        port: u16,
        size: u64,
    ) {
        if !verify_host(&self.config.upload_hosts, hostmask, false) {
            info!("upload denied from {}", hostmask);
            self.notice(
                nick,
                format!("DCC Send Denied, I don't accept transfers from {}", hostmask),
            );
            return;
        }
        if self.config.upload_max_size != 0 && size > self.config.upload_max_size {
            info!("upload denied (too big) from {}", hostmask);
            self.notice(nick, "DCC Send Denied, I don't accept transfers that big".into());
            return;
        }
        if size > self.config.max_file_size {
            info!("upload denied (too large) from {}", hostmask);
            self.notice(
                nick,
                "DCC Send Denied, I can't accept transfers that large".into(),
            );
            return;
        }
        if self.registry.active_uploads() >= self.config.max_uploads {
            info!("upload denied (too many uploads) from {}", hostmask);
            self.notice(
                nick,
                "DCC Send Denied, I'm already getting too many files".into(),
            );
            return;
        }

        let now = unix_ms() / 1000;
        let id = self.registry.alloc_id();
        let mut session = UploadSession::new(id, nick, hostname, filename, ip, port, size, now);

        info!(
            "upload {} accepted from {}: {} ({}KB)",
            id,
            nick,
            session.filename,
            size / 1024,
        );

        let outcome = session.establish(&self.config.upload_dir);
        self.registry.uploads.push(session);
        let idx = self.registry.uploads.len() - 1;
        self.apply_establish(idx, outcome);
    }

    fn on_resume_ack(&mut self, nick: &str, port: u16) {
        let found = self
            .registry
            .uploads
            .iter()
            .position(|u| u.remote_port == port && u.nick == nick);

        let idx = match found {
            Some(idx) => idx,
            None => {
                self.notice(nick, "DCC Resume Denied, unable to find transfer".into());
                warn!("couldn't find upload that {} tried to resume", nick);
                return;
            }
        };

        let upload_dir = self.config.upload_dir.clone();
        let ul = &mut self.registry.uploads[idx];
        ul.resume_accepted = true;
        info!(
            "upload {} resumed from {}: {} ({} of {}KB left)",
            ul.id,
            nick,
            ul.filename,
            (ul.total_size - ul.resume_size) / 1024,
            ul.total_size / 1024,
        );
        let outcome = ul.establish(&upload_dir);
        self.apply_establish(idx, outcome);
    }

    /// establish 결과 반영: 연결 시작 / 재개 요청 송신 / 거부
    fn apply_establish(&mut self, idx: usize, outcome: Establish) {
        match outcome {
            Establish::Connect(addr) => {
                let ul = &mut self.registry.uploads[idx];
                let id = ul.id;
                let cmd_tx = self.cmd_tx.clone();
                let secs = self.config.connect_timeout_secs;
                ul.connect_task = Some(tokio::spawn(async move {
                    let result =
                        match tokio::time::timeout(Duration::from_secs(secs), TcpStream::connect(addr))
                            .await
                        {
                            Ok(r) => r,
                            Err(_) => Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "connect timed out",
                            )),
                        };
                    let _ = cmd_tx.send(EngineCmd::UploadConnected { id, result });
                }));
                let nick = ul.nick.clone();
                self.notice(&nick, "DCC Send Accepted, Connecting...".into());
            }
            Establish::ResumeRequest { port, offset } => {
                let ul = &self.registry.uploads[idx];
                let (nick, filename) = (ul.nick.clone(), ul.filename.clone());
                debug!("upload {}: requesting resume at {}", ul.id, offset);
                self.ctcp(
                    &nick,
                    Dcc::Resume {
                        name: filename,
                        port,
                        offset,
                    }
                    .to_wire(),
                );
            }
            Establish::Refused(reason) => {
                self.close_upload_idx(idx, &reason);
            }
        }
    }

    fn on_upload_connected(&mut self, id: u32, result: std::io::Result<TcpStream>) {
        let now = unix_ms() / 1000;
        let found = self
            .registry
            .uploads
            .iter()
            .position(|u| u.id == id && u.status == UploadStatus::Connecting);

        let idx = match found {
            Some(idx) => idx,
            None => {
                debug!("stale connect completion for upload {}", id);
                return;
            }
        };

        match result {
            Ok(stream) => {
                let ul = &mut self.registry.uploads[idx];
                ul.attach_stream(stream, now);
                let nick = ul.nick.clone();
                info!("upload {}: connection established", id);
                self.notice(&nick, "DCC Connection Established".into());
            }
            Err(e) => {
                let reason = format!("Upload Connection Failed: {}", e);
                self.close_upload_idx(idx, &reason);
            }
        }
    }

    // ───────────────────────── 주기 작업 ─────────────────────────

    /// 쿼터초: 속도 제한 세션의 버킷 충전
    fn refill_buckets(&mut self) {
        for tr in &mut self.registry.transfers {
            if tr.status == TransferStatus::Done || tr.no_max {
                continue;
            }
            let max = self
                .catalog
                .by_id(tr.pack_id)
                .map(|p| self.config.effective_max_kbs(p.max_speed_kbs))
                .unwrap_or(0.0);
            if max > 0.0 {
                tr.bucket.refill(max);
            }
        }
    }

    /// 쿼터초: ACK/역압 드레인 (Sending/Waiting)
    fn drain_transfer_acks(&mut self, now: u64) {
        for idx in 0..self.registry.transfers.len() {
            let status = self.registry.transfers[idx].status;
            if !matches!(status, TransferStatus::Sending | TransferStatus::Waiting) {
                continue;
            }
            if let Err(e) = self.registry.transfers[idx].drain_acks(now) {
                let reason = format!("Connection Lost: {}", e);
                self.close_transfer_idx(idx, &reason);
            }
        }

        // Waiting 세션의 플러시 판정은 매 드레인 직후
        for idx in 0..self.registry.transfers.len() {
            if self.registry.transfers[idx].check_flushed(now) {
                self.complete_transfer_idx(idx, now);
            }
        }
    }

    /// 쿼터초: 회전 커서 기반 송신 스윕
    ///
    /// 전역 상한에 걸리면 이번 틱은 아무도 쓰지 않는다. 세션은 패스당
    /// 최대 한 번 서비스되므로, 모든 세션이 한 번씩 돌기 전에 같은
    /// 세션이 두 번 서비스되는 일은 없다.
    fn service_transfers(&mut self, now: u64) {
        // 소켓이 빨리 비워지면 한 틱 안에서 여러 라운드를 돈다.
        // 라운드마다 회전 순서로 전원을 한 번씩 방문하므로 공정성은
        // 라운드 단위로 유지되고, 상한으로 틱당 총량은 유계다.
        const ROUNDS_PER_TICK: usize = 64;

        for _ in 0..ROUNDS_PER_TICK {
            if self.sent.over_limit(now, self.max_kbs) {
                return;
            }

            let order = self.registry.rotation_order();
            let mut wrote_any = false;

            for idx in order {
                let (pack_size, throttled) = {
                    let tr = &self.registry.transfers[idx];
                    if tr.status != TransferStatus::Sending {
                        continue;
                    }
                    match self.catalog.by_id(tr.pack_id) {
                        Some(pack) => {
                            let max = self.config.effective_max_kbs(pack.max_speed_kbs);
                            (pack.size, max > 0.0 && !tr.no_max)
                        }
                        None => {
                            self.close_transfer_idx(idx, "Pack no longer available");
                            continue;
                        }
                    }
                };

                let outcome = match self.registry.transfers[idx].service_send(
                    pack_size,
                    throttled,
                    &mut self.buf,
                    now,
                ) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let reason = format!("Connection Lost: {}", e);
                        self.close_transfer_idx(idx, &reason);
                        continue;
                    }
                };

                if outcome.wrote > 0 {
                    wrote_any = true;
                    self.sent.record(now, outcome.wrote);
                    self.limits.record(outcome.wrote);
                    self.stats.total_sent += outcome.wrote;
                }

                if self.sent.over_limit(now, self.max_kbs) {
                    // 예산 소진. 커서 덕에 다음 라운드는 다음 세션부터
                    break;
                }
            }

            if !wrote_any {
                break;
            }
        }
    }

    /// 쿼터초: 업로드 수신 스윕
    fn service_uploads(&mut self, now: u64) {
        const ROUNDS_PER_TICK: usize = 64;

        for _ in 0..ROUNDS_PER_TICK {
            let mut got_any = false;
            for idx in 0..self.registry.uploads.len() {
                if self.registry.uploads[idx].status != UploadStatus::Getting {
                    continue;
                }

                let outcome = match self.registry.uploads[idx].service_recv(&mut self.buf, now) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let reason = format!("Connection Lost: {}", e);
                        self.close_upload_idx(idx, &reason);
                        continue;
                    }
                };

                if outcome.got > 0 {
                    got_any = true;
                    self.sent.record(now, outcome.got);
                }

                if outcome.reached_total {
                    self.finish_upload(idx, now);
                }
            }

            if !got_any {
                break;
            }
        }
    }

    /// 선언된 총량 도달: 완료 알림 (Done 전환은 짧은 유휴 후)
    fn finish_upload(&mut self, idx: usize, now: u64) {
        let (id, nick, bytes, took) = {
            let ul = &self.registry.uploads[idx];
            let took = now.saturating_sub(ul.connect_time).max(1);
            (ul.id, ul.nick.clone(), ul.effective_bytes(), took)
        };

        let kbs = bytes as f64 / 1024.0 / took as f64;
        info!(
            "upload {}: transfer completed ({} KB, {:.1} KB/sec)",
            id,
            bytes / 1024,
            kbs,
        );
        self.stats.completed_uploads += 1;
        self.notice(
            &nick,
            format!(
                "** Upload Completed ({} KB, {} sec, {:.1} KB/sec)",
                bytes / 1024,
                took,
                kbs,
            ),
        );
    }

    /// 1초: 리슨 리마인더와 타임아웃, 유휴 상한
    fn transfer_liveness(&mut self, now: u64) {
        for idx in 0..self.registry.transfers.len() {
            let (due, stage, timed_out, idle) = {
                let tr = &self.registry.transfers[idx];
                (
                    tr.remind_due(now, &self.config),
                    tr.reminders_sent,
                    tr.listen_timed_out(now, &self.config),
                    tr.idle_timed_out(now, &self.config),
                )
            };

            if timed_out {
                self.close_transfer_idx(idx, "timed out");
                continue;
            }
            if idle {
                self.close_transfer_idx(idx, "idle timeout");
                continue;
            }

            // 첫 리마인더는 항상, 이후는 조용한 모드가 아닐 때만
            if due && (stage == 0 || !self.config.quiet_mode) {
                let (nick, remaining) = {
                    let tr = &mut self.registry.transfers[idx];
                    tr.reminders_sent += 1;
                    (
                        tr.nick.clone(),
                        self.config
                            .listen_timeout_secs
                            .saturating_sub(now.saturating_sub(tr.last_contact)),
                    )
                };
                self.notice(
                    &nick,
                    format!(
                        "** You have a DCC pending, Set your client to receive the transfer. ({} seconds remaining until timeout)",
                        remaining,
                    ),
                );
            }
        }
    }

    /// 1초: 업로드 연결 타임아웃, 완료 판정, 유휴 상한
    fn upload_liveness(&mut self, now: u64) {
        for idx in 0..self.registry.uploads.len() {
            let (connect_to, idle) = {
                let ul = &self.registry.uploads[idx];
                (
                    ul.connect_timed_out(now, &self.config),
                    ul.idle_timed_out(now, &self.config),
                )
            };

            if connect_to {
                self.close_upload_idx(idx, "Upload Connection Timed Out");
                continue;
            }

            if self.registry.uploads[idx].check_complete(now) {
                debug!("upload {} done", self.registry.uploads[idx].id);
                continue;
            }

            if idle {
                self.close_upload_idx(
                    idx,
                    &format!("DCC Timeout ({} Sec Timeout)", self.config.idle_ceiling_secs),
                );
            }
        }
    }

    /// 1초: Done 세션 수거, 빈 슬롯마다 한 건씩 대기열 승격
    async fn reap_and_promote(&mut self, _now: u64) {
        let reaped = self.registry.reap_transfers();
        self.registry.reap_uploads();

        for _ in 0..reaped.len() {
            if self.registry.queue.is_empty() {
                break;
            }
            let cap = self.config.hard_slot_cap.min(self.config.slots_max);
            if self.registry.active_transfers() >= cap {
                break;
            }
            self.promote_one(PromoteMode::SlotFreed).await;
        }
    }

    /// 대기열 승격 한 건
    async fn promote_one(&mut self, mode: PromoteMode) {
        let entry = match admission::promote_queue(&mut self.registry, &self.config, mode) {
            Some(entry) => entry,
            None => return,
        };

        if self.catalog.by_id(entry.pack_id).is_none() {
            // 대기 중 팩이 제거됨
            self.notice(&entry.nick, "** Invalid Pack Number, Try Again".into());
            return;
        }

        let label = match mode {
            PromoteMode::SlotFreed => "",
            PromoteMode::LowBandwidth => " (low bandwidth)",
            PromoteMode::Manual => " (manual)",
        };
        info!("queued send{}: {} ({})", label, entry.nick, entry.hostname);

        self.start_transfer(&entry.nick, &entry.hostname, entry.pack_id, true)
            .await;
    }

    /// 1초: 전송량 한도 스윕과 초과 전환 처리
    fn sweep_limits(&mut self, _now: u64) {
        let sweep = self.limits.sweep(Local::now());

        for kind in &sweep.resets {
            info!("resetting {} transfer limit", kind.label());
        }
        if sweep.just_cleared {
            info!("no longer over any transfer limits, transfers are now allowed");
        }

        if let Some(kind) = sweep.just_exceeded {
            let text = self
                .limits
                .deny_message()
                .unwrap_or_else(|| "** Transfer limit exceeded.".into());
            info!("{} transfer limit used up, stopping transfers", kind.label());

            // 대기열 비우기
            let queued: Vec<QueueEntry> = self.registry.queue.drain(..).collect();
            for entry in queued {
                self.notice(&entry.nick, text.clone());
            }

            // 활성 전송 중단
            for idx in 0..self.registry.transfers.len() {
                if self.registry.transfers[idx].status != TransferStatus::Done {
                    self.close_transfer_idx(idx, &text);
                }
            }
        }
    }

    /// 4초: 평활화 속도 갱신과 최소 속도 집행
    fn update_speeds(&mut self, now: u64, dt: Duration) {
        for idx in 0..self.registry.transfers.len() {
            let min_kbs = {
                let tr = &self.registry.transfers[idx];
                if tr.status == TransferStatus::Done {
                    continue;
                }
                self.catalog
                    .by_id(tr.pack_id)
                    .map(|p| self.config.effective_min_kbs(p.min_speed_kbs))
                    .unwrap_or(0.0)
            };

            let below = {
                let tr = &mut self.registry.transfers[idx];
                let initial = tr.in_initial_window(now, &self.config);
                tr.speed.update(tr.bytes_sent, dt, initial);
                self.stats.note_session_speed(tr.speed.kbs());
                tr.below_min_speed(now, min_kbs, &self.config)
            };

            if below {
                self.close_transfer_idx(idx, "Transfer speed too slow, aborted");
            }
        }

        for ul in &mut self.registry.uploads {
            if ul.status == UploadStatus::Done {
                continue;
            }
            let initial = ul.connect_time + self.config.min_measure_secs / 2 > now;
            ul.speed.update(ul.bytes_got, dt, initial);
        }
    }

    /// 20초: 카탈로그 파일 변경 감지, 변경된 팩의 전송 강제 종료
    fn rescan_catalog(&mut self) {
        let mut changed: Vec<PackId> = Vec::new();
        for pack in self.catalog.iter_mut() {
            if pack.check_file_changed() {
                changed.push(pack.id);
            }
        }

        for pack_id in changed {
            self.close_transfers_for_pack(pack_id, "Pack file has changed, aborting transfer");
        }
    }

    /// 분: 멤버 제한 재검증, 떠난 요청자의 대기열 항목 제거
    fn reverify_restricted_queue(&mut self) {
        let members = &self.members;
        let dropped: Vec<QueueEntry> = {
            let (keep, drop): (Vec<_>, Vec<_>) = self
                .registry
                .queue
                .drain(..)
                .partition(|q| members.contains(&caps(&q.nick)));
            self.registry.queue = keep.into();
            drop
        };

        for entry in dropped {
            info!("removed {} from queue (no longer a known member)", entry.nick);
            self.notice(
                &entry.nick,
                "** You are no longer on a known channel, removed from queue".into(),
            );
        }
    }

    /// 3분: 저대역폭 기회 승격 + 상태 저장
    fn low_bandwidth_pump(&mut self, now: u64) {
        if self.config.low_bandwidth_kbs == 0 || self.registry.queue.is_empty() {
            return;
        }
        if self.registry.active_transfers() >= self.config.hard_slot_cap {
            return;
        }
        if self.sent.recent_kbs(now) < self.config.low_bandwidth_kbs as f64 {
            let cmd_tx = self.cmd_tx.clone();
            // 다음 패스에서 처리 (이 지점은 동기 컨텍스트)
            let _ = cmd_tx.send(EngineCmd::PromoteQueue {
                mode: PromoteMode::LowBandwidth,
            });
        }
    }

    /// 시간: 스케줄에 따른 전역 상한 재계산
    fn recompute_max_kbs(&mut self) {
        let schedule = RateSchedule {
            base_kbs: self.config.overall_max_kbs,
            day_kbs: self.config.day_max_kbs,
            day_start_hour: self.config.day_start_hour,
            day_end_hour: self.config.day_end_hour,
            day_days: self.config.day_days,
        };
        let fresh = schedule.current_max_kbs(Local::now());
        if fresh != self.max_kbs {
            info!("bandwidth cap now {} KB/s", fresh);
            self.max_kbs = fresh;
        }
    }

    /// 1초: 체크섬이 없는 팩이 있으면 빌더 시작
    fn schedule_checksum(&mut self) {
        if self.checksum.is_some() {
            return;
        }
        let pack_id = match self.catalog.next_unsummed() {
            Some(id) => id,
            None => return,
        };
        let path = match self.catalog.by_id(pack_id) {
            Some(pack) => pack.file.clone(),
            None => return,
        };
        match ChecksumBuilder::start(pack_id, &path) {
            Ok(builder) => self.checksum = Some(builder),
            Err(e) => {
                warn!("[CRC]: can't access pack {}: {}", pack_id, e);
                // 실패한 팩이 매초 재시도되지 않게 0으로 마킹
                if let Some(pack) = self.catalog.by_id_mut(pack_id) {
                    pack.checksum = Some(0);
                }
            }
        }
    }

    /// 매 패스: 체크섬 빌더 한 스텝
    fn step_checksum(&mut self) {
        let builder = match self.checksum.as_mut() {
            Some(builder) => builder,
            None => return,
        };

        match builder.step() {
            ChecksumStep::Pending => {}
            ChecksumStep::Done { pack_id, crc32 } => {
                if let Some(pack) = self.catalog.by_id_mut(pack_id) {
                    pack.checksum = Some(crc32);
                }
                self.checksum = None;
            }
            ChecksumStep::Failed { pack_id } => {
                if let Some(pack) = self.catalog.by_id_mut(pack_id) {
                    pack.checksum = Some(0);
                }
                self.checksum = None;
            }
        }
    }

    // ───────────────────────── 종료 경로 ─────────────────────────

    /// 팩을 참조하는 모든 활성 전송 강제 종료
    fn close_transfers_for_pack(&mut self, pack_id: PackId, reason: &str) {
        for idx in 0..self.registry.transfers.len() {
            let tr = &self.registry.transfers[idx];
            if tr.pack_id == pack_id && tr.status != TransferStatus::Done {
                self.close_transfer_idx(idx, reason);
            }
        }
    }

    fn on_remove_pack(&mut self, number: usize) {
        let pack_id = match self.catalog.by_number(number) {
            Some(pack) => pack.id,
            None => {
                warn!("remove requested for unknown pack number {}", number);
                return;
            }
        };

        self.close_transfers_for_pack(pack_id, "Pack removed");

        let queued: Vec<QueueEntry> = {
            let (drop, keep): (Vec<_>, Vec<_>) = self
                .registry
                .queue
                .drain(..)
                .partition(|q| q.pack_id == pack_id);
            self.registry.queue = keep.into();
            drop
        };
        for entry in queued {
            self.notice(&entry.nick, "** The pack you were queued for has been removed".into());
        }

        if self
            .checksum
            .as_ref()
            .map(|b| b.pack_id() == pack_id)
            .unwrap_or(false)
        {
            self.checksum = None;
        }

        self.catalog.remove(number);
        info!("pack {} removed ({} left)", pack_id, self.catalog.len());
        self.persist();
    }

    /// 송신 세션 강제/정상 종료 공통 경로
    ///
    /// 팩 핸들 반환과 소켓 해제를 호출 안에서 동기적으로 끝낸다.
    fn close_transfer_idx(&mut self, idx: usize, reason: &str) {
        let (id, nick, pack_id, had_handle) = {
            let tr = &mut self.registry.transfers[idx];
            if tr.status == TransferStatus::Done {
                return;
            }
            let had_handle = tr.file.is_some();
            let info = (tr.id, tr.nick.clone(), tr.pack_id, had_handle);
            tr.teardown();
            info
        };

        if had_handle {
            if let Some(pack) = self.catalog.by_id_mut(pack_id) {
                pack.release_handle();
            }
        }

        info!("transfer {}: connection closed: {}", id, reason);
        self.notice(&nick, format!("** Closing Connection: {}", reason));
    }

    /// 송신 완료 처리 (Waiting → Done 판정 이후)
    fn complete_transfer_idx(&mut self, idx: usize, now: u64) {
        let (id, nick, pack_id, bytes, took) = {
            let tr = &mut self.registry.transfers[idx];
            let bytes = tr.bytes_sent.saturating_sub(tr.start_resume).max(1);
            let took = now.saturating_sub(tr.connect_time).max(1);
            let info = (tr.id, tr.nick.clone(), tr.pack_id, bytes, took);
            tr.teardown();
            info
        };

        if let Some(pack) = self.catalog.by_id_mut(pack_id) {
            pack.gets += 1;
            pack.release_handle();
        }

        self.stats.completed_transfers += 1;
        let kbs = bytes as f64 / 1024.0 / took as f64;
        info!(
            "transfer {}: completed ({} KB, {} sec, {:.1} KB/sec)",
            id,
            bytes / 1024,
            took,
            kbs,
        );
        self.notice(
            &nick,
            format!(
                "** Transfer Completed ({} KB, {} sec, {:.1} KB/sec)",
                bytes / 1024,
                took,
                kbs,
            ),
        );
    }

    fn close_upload_idx(&mut self, idx: usize, reason: &str) {
        let nick = {
            let ul = &mut self.registry.uploads[idx];
            if ul.status == UploadStatus::Done {
                return;
            }
            let nick = ul.nick.clone();
            info!("upload {}: connection closed: {}", ul.id, reason);
            ul.teardown();
            nick
        };
        self.notice(&nick, format!("** Closing Upload Connection: {}", reason));
    }

    fn shutdown(&mut self) {
        info!("engine shutting down");
        for idx in 0..self.registry.transfers.len() {
            self.close_transfer_idx(idx, "Server Shutting Down");
        }
        for idx in 0..self.registry.uploads.len() {
            self.close_upload_idx(idx, "Server Shutting Down");
        }
        self.registry.reap_transfers();
        self.registry.reap_uploads();
        self.persist();
        self.publish_snapshots();
    }

    // ───────────────────────── 보조 ─────────────────────────

    fn notice(&self, nick: &str, text: String) {
        let _ = self.chat_tx.send(ChatEvent::Notice {
            nick: nick.to_string(),
            text,
        });
    }

    fn ctcp(&self, nick: &str, text: String) {
        let _ = self.chat_tx.send(ChatEvent::Ctcp {
            nick: nick.to_string(),
            text,
        });
    }

    /// 상태 저장 훅 (fire-and-forget)
    fn persist(&self) {
        let saved = SavedState::collect(&self.catalog, &self.limits, &self.stats);
        match saved.encode() {
            Ok(bytes) => {
                let _ = self.persist_tx.send(bytes);
            }
            Err(e) => warn!("state snapshot failed: {}", e),
        }
    }

    /// 읽기 전용 스냅샷 발행
    fn publish_snapshots(&mut self) {
        self.snapshots.transfers.clear();
        let catalog = &self.catalog;
        for snap in self
            .registry
            .transfer_snapshots(|pid| catalog.by_id(pid).map(|p| p.size).unwrap_or(0))
        {
            self.snapshots.transfers.insert(snap.id, snap);
        }

        self.snapshots.uploads.clear();
        for snap in self.registry.upload_snapshots() {
            self.snapshots.uploads.insert(snap.id, snap);
        }

        *self.snapshots.queue.write() = self.registry.queue.iter().cloned().collect();
        *self.snapshots.stats.write() = self.stats.clone();
    }
}
