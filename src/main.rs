use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xcrack_onchain_executor::blockchain::{ChainConnector, EthersConnector, TxSigner, WalletSigner};
use xcrack_onchain_executor::mocks::{self, MockChainClient, MockConnector, MockPriceFeed};
use xcrack_onchain_executor::oracle::{HttpPriceFeed, PriceFeed};
use xcrack_onchain_executor::{Config, MainCore};

/// mock 모드에서 개인키가 없을 때 쓰는 로컬 개발 체인 기본 계정
const MOCK_DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

fn cli() -> Command {
    Command::new("xcrack-onchain-executor")
        .version(env!("CARGO_PKG_VERSION"))
        .author("xCrack Team <team@xcrack.dev>")
        .about("🦀 온체인 트랜잭션 실행 엔진 - 멤풀 감시, 안전성 검사, nonce 관리, 수수료 상향 재제출")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("설정 파일 경로")
                .default_value("config/default.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("로그 레벨 (trace, debug, info, warn, error)")
                .default_value("info"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("시뮬레이션까지만 수행 (브로드캐스트 안 함)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("mock")
                .long("mock")
                .help("mock 체인/가격 피드로 실행 (API_MODE=mock 과 동일)")
                .action(clap::ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let matches = cli().get_matches();

    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let log_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => log_level,
        _ => "info",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner();

    let mock_mode = matches.get_flag("mock") || mocks::is_mock_mode();
    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config/default.toml");
    info!("📋 설정 파일 로드 중: {}", config_path);

    let mut config = match Config::load(config_path).await {
        Ok(config) => config,
        Err(e) if mock_mode => {
            warn!("⚠️ 설정 파일을 읽지 못해 기본값 사용 (mock 모드): {}", e);
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("설정 파일 로드 실패: {}", config_path)),
    };

    if matches.get_flag("dry-run") {
        warn!("🧪 dry-run 모드 활성화 - 트랜잭션을 브로드캐스트하지 않습니다");
        config.execution.dry_run = true;
    }

    load_environment_variables(&mut config);

    if mock_mode {
        config.network.chain_id = mocks::get_mock_config().chain_id;
        if config.wallet.private_key.is_empty() {
            config.wallet.private_key = MOCK_DEV_KEY.to_string();
        }
    }

    if let Err(e) = config.validate() {
        error!("❌ 설정 검증 실패: {}", e);
        std::process::exit(1);
    }
    info!("✅ 설정 로드 완료 (체인 {}, 감시 토큰 {:?})", config.network.chain_id, config.monitored_tokens);

    let signer: Arc<dyn TxSigner> = Arc::new(
        WalletSigner::from_private_key(&config.wallet.private_key, config.network.chain_id)
            .context("서명자 초기화 실패")?,
    );

    let (connector, feed, mock_chain): (Arc<dyn ChainConnector>, Arc<dyn PriceFeed>, Option<Arc<MockChainClient>>) =
        if mock_mode {
            info!("🎭 mock 모드로 실행");
            let chain = Arc::new(MockChainClient::from_env());
            (
                Arc::new(MockConnector::new(chain.clone(), 0)),
                Arc::new(MockPriceFeed::with_defaults()),
                Some(chain),
            )
        } else {
            (
                Arc::new(EthersConnector::from_config(&config)),
                Arc::new(HttpPriceFeed::new(&config).context("가격 피드 초기화 실패")?),
                None,
            )
        };

    let monitored = config.monitored_token_addresses()?;
    let core = Arc::new(MainCore::new(config, connector, signer, feed));
    let cancel = core.cancel_token();

    if let Some(chain) = mock_chain {
        chain.start_pending_generation(monitored, cancel.clone());
    }

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => warn!("🛑 종료 신호 수신됨, 안전하게 종료 중..."),
                Err(err) => error!("❌ 신호 처리 오류: {}", err),
            }
            cancel.cancel();
        }
    });

    let result = core.run().await;

    let status = core.status().await;
    match serde_json::to_string_pretty(&status) {
        Ok(json) => info!("📊 최종 상태:\n{}", json),
        Err(e) => warn!("⚠️ 상태 직렬화 실패: {}", e),
    }

    result.context("실행기 비정상 종료")?;
    info!("👋 종료");
    Ok(())
}

fn load_environment_variables(config: &mut Config) {
    if let Ok(private_key) = env::var("PRIVATE_KEY") {
        config.wallet.private_key = private_key;
        info!("🔑 Private key loaded from environment");
    }

    if let Ok(rpc_url) = env::var("RPC_URL") {
        config.network.rpc_url = rpc_url;
        info!("🌐 RPC URL loaded from environment");
    }

    if let Ok(ws_url) = env::var("WS_URL") {
        config.network.ws_url = Some(ws_url);
        info!("🔌 WebSocket URL loaded from environment");
    }

    if let Ok(chain_id) = env::var("CHAIN_ID") {
        match chain_id.parse() {
            Ok(id) => config.network.chain_id = id,
            Err(_) => warn!("⚠️ CHAIN_ID 파싱 실패: {}", chain_id),
        }
    }

    if let Ok(path) = env::var("TX_LOG_PATH") {
        config.storage.enabled = true;
        config.storage.path = path;
        info!("📦 트랜잭션 기록 경로 loaded from environment");
    }
}

fn print_banner() {
    println!(r#"
    ╔══════════════════════════════════════════════════════════════╗
    ║                                                              ║
    ║  🦀 xCrack On-chain Executor                                 ║
    ║                                                              ║
    ║  🎯 파이프라인:                                              ║
    ║     • 펜딩 트랜잭션 구독 → 토큰 필터 → 사전 점수             ║
    ║     • 안전성 검사 → 시뮬레이션 → 서명 → 제출                 ║
    ║     • 타임아웃/언더프라이스 시 수수료 상향 재제출            ║
    ║                                                              ║
    ║  🛡️ 안전 장치:                                              ║
    ║     • nonce 반납/재동기화                                    ║
    ║     • 잔고 기반 서킷 브레이커                                ║
    ║     • dry-run 모드                                           ║
    ║                                                              ║
    ╚══════════════════════════════════════════════════════════════╝
    "#);
}
