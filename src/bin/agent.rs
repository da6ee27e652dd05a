//! PFS 에이전트 데몬 - Pack Flow Server
//!
//! 디렉터리의 파일들을 팩으로 제공하는 전송 엔진 데몬.
//! 채팅 링크 계층은 바깥에서 붙는다. 이 바이너리는 엔진을 띄우고
//! 나가는 알림/제안을 로그로, 상태 스냅샷을 statefile로 흘려보낸다.
//!
//! 사용법:
//!   cargo run --release --bin pfs-agent -- [OPTIONS]
//!
//! 예시:
//!   # 디렉터리 제공
//!   cargo run --release --bin pfs-agent -- --dir ./shared
//!
//!   # 슬롯 4개 + 전역 2MB/s 상한
//!   cargo run --release --bin pfs-agent -- -d ./shared --slots 4 --max-kbs 2048

use std::path::PathBuf;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use pfs::state::SavedState;
use pfs::{Config, Engine, PackCatalog};

/// 데몬 설정
struct AgentConfig {
    share_dir: Option<PathBuf>,
    state_file: PathBuf,
    config: Config,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            share_dir: None,
            state_file: PathBuf::from("pfs.state"),
            config: Config::default(),
        }
    }
}

fn parse_args() -> AgentConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut agent = AgentConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" | "-d" => {
                if i + 1 < args.len() {
                    agent.share_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--state" | "-s" => {
                if i + 1 < args.len() {
                    agent.state_file = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--slots" => {
                if i + 1 < args.len() {
                    agent.config.slots_max = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--max-kbs" => {
                if i + 1 < args.len() {
                    agent.config.overall_max_kbs = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--queue-size" => {
                if i + 1 < args.len() {
                    agent.config.queue_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--port-range" => {
                if i + 1 < args.len() {
                    let parts: Vec<&str> = args[i + 1].split('-').collect();
                    if parts.len() == 2 {
                        agent.config.port_range = (
                            parts[0].parse().expect("유효한 포트 필요"),
                            parts[1].parse().expect("유효한 포트 필요"),
                        );
                    }
                    i += 1;
                }
            }
            "--upload-dir" => {
                if i + 1 < args.len() {
                    agent.config.upload_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--quiet" | "-q" => {
                agent.config.quiet_mode = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"PFS Agent - Pack Flow Server 데몬

채팅 네트워크용 파일 제공 에이전트의 전송 엔진
- 승인 컨트롤러 + FIFO 대기열 + 공정 순환 서비스
- 전역/팩별 대역폭 제한, 전송량 한도, 재개 협상

사용법:
  cargo run --release --bin pfs-agent -- [OPTIONS]

옵션:
  -d, --dir <PATH>        제공할 파일 디렉터리
  -s, --state <PATH>      상태 스냅샷 파일 (기본: pfs.state)
  --slots <N>             전역 동시 전송 슬롯 (기본: 10)
  --max-kbs <N>           전역 대역폭 상한 KB/s (기본: 무제한)
  --queue-size <N>        대기열 크기 (기본: 20)
  --port-range <A-B>      리슨 포트 범위 (기본: 임시 포트)
  --upload-dir <PATH>     업로드 저장 디렉터리 (기본: uploads)
  -q, --quiet             조용한 모드
  -h, --help              이 도움말 출력

예시:
  # 디렉터리 제공 + 포트 범위 고정
  cargo run --release --bin pfs-agent -- -d ./shared --port-range 40000-40100
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    agent
}

/// 디렉터리의 일반 파일을 전부 팩으로 등록
fn build_catalog(agent: &AgentConfig) -> PackCatalog {
    // 이전 스냅샷이 있으면 gets/속도 설정을 물려받는다
    if let Ok(bytes) = std::fs::read(&agent.state_file) {
        match SavedState::decode(&bytes) {
            Ok(saved) => {
                info!("state restored from {:?}", agent.state_file);
                return saved.restore_catalog();
            }
            Err(e) => warn!("state file unreadable, starting fresh: {}", e),
        }
    }

    let mut catalog = PackCatalog::new();
    let dir = match &agent.share_dir {
        Some(dir) => dir.clone(),
        None => return catalog,
    };

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("can't read share dir {:?}: {}", dir, e);
            return catalog;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    for path in paths {
        let desc = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match catalog.add(path.clone(), desc) {
            Ok(id) => info!("pack {} offered: {:?}", id, path),
            Err(e) => warn!("skipped {:?}: {}", path, e),
        }
    }

    catalog
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let agent = parse_args();

    info!("PFS Agent starting...");
    info!("Slots: {}", agent.config.slots_max);
    info!(
        "Bandwidth cap: {}",
        if agent.config.overall_max_kbs == 0 {
            "unlimited".to_string()
        } else {
            format!("{} KB/s", agent.config.overall_max_kbs)
        }
    );

    std::fs::create_dir_all(&agent.config.upload_dir)?;

    let catalog = build_catalog(&agent);
    if catalog.is_empty() {
        warn!("catalog is empty, offering nothing (use --dir)");
    }

    let state_file = agent.state_file.clone();
    let (engine, handle, mut chat_rx, mut persist_rx) = Engine::new(agent.config, catalog);

    // 채팅 계층 자리: 나가는 알림/제안을 로그로 흘린다
    tokio::spawn(async move {
        while let Some(event) = chat_rx.recv().await {
            match event {
                pfs::ChatEvent::Notice { nick, text } => info!("-> {}: {}", nick, text),
                pfs::ChatEvent::Ctcp { nick, text } => {
                    info!("-> {} (ctcp): {}", nick, text.trim_matches('\x01'))
                }
            }
        }
    });

    // 상태 스냅샷 기록기
    tokio::spawn(async move {
        while let Some(bytes) = persist_rx.recv().await {
            if let Err(e) = std::fs::write(&state_file, &bytes) {
                warn!("can't write state file: {}", e);
            }
        }
    });

    // 종료 신호
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown_handle.shutdown();
        }
    });

    engine.run().await;
    info!("{}", handle.stats().summary());
    Ok(())
}
