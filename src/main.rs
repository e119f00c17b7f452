use anyhow::{bail, Result};
use log::info;
use myy_avkit::dispatch::{self, ActorRef, AvThread, Dispatch, Message, ThreadPriority};
use myy_avkit::player::{SyntheticBackend, ThreadPresenter};
use myy_avkit::{Player, PlayerConfig, PlayerStatus};
use myy_avkit::core::StatusData;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 没有参数时播放的演示媒体
const DEMO_MEDIA: &str = "synthetic:duration=3000,fps=25,chapters=1000,title=demo";

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 myy_avkit 启动");

    let config = PlayerConfig::from_env();
    dispatch::configure(config.runtime.clone());

    let mut items: Vec<String> = std::env::args().skip(1).collect();
    if items.is_empty() {
        items.push(DEMO_MEDIA.to_string());
    }
    if let Some(bad) = items.iter().find(|p| !p.starts_with(myy_avkit::player::synthetic::SCHEME)) {
        bail!("只支持合成媒体（{}...）: {}", myy_avkit::player::synthetic::SCHEME, bad);
    }

    let backend = Arc::new(SyntheticBackend::new());
    let presenter = Arc::new(ThreadPresenter::new(320, 180)?);
    let player = Player::new(backend, presenter.clone(), config)?;

    // 状态观察者
    let observer_thread = AvThread::spawn("status-observer", ThreadPriority::Normal)?;
    let observer = ActorRef::new_on(observer_thread.queue(), "status-observer", |_this: ActorRef, msg: &Message| {
        if let Some(data) = msg.payload::<StatusData>() {
            info!("📣 播放器状态: {:?} -> {:?}", data.last_status, data.status);
        }
        Dispatch::Ok
    })?;
    player.subscribe(observer)?;

    let count = items.len();
    player.playlist(items, 0)?;

    // 全部播完回到 READY
    let deadline = Instant::now() + Duration::from_secs(600);
    loop {
        thread::sleep(Duration::from_millis(500));
        let stats = player.stats();
        info!(
            "⏱️ {:?} {} / {}ms，缓冲 {}%，已呈现 {} 帧",
            player.status(),
            player.position() / 1000,
            player.duration() / 1000,
            player.buffer_percent(),
            presenter.frames_rendered()
        );
        if stats.teardowns as usize >= count && player.status() == PlayerStatus::Ready {
            break;
        }
        if stats.sessions == 0 && player.last_error().is_some() {
            break;
        }
        if Instant::now() > deadline {
            bail!("播放超时");
        }
    }

    let stats = player.stats();
    info!(
        "✅ 播放结束：{} 个周期，{} 次 flush，最后错误: {}",
        stats.sessions,
        stats.flushes,
        player.last_error().unwrap_or_else(|| "无".to_string())
    );
    drop(player);
    drop(observer_thread);
    presenter.cleanup();
    dispatch::log_summary();
    Ok(())
}
