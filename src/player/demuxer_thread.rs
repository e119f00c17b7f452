use super::backend::{DemuxEvent, Demuxer};
use super::manager::PlayerCtl;
use super::pipeline::{Pipeline, Push};
use crate::core::{log_ctx, FlushFlags, Packet, PacketKind, Result, Stage};
use log::{debug, error, info, warn};
use std::time::Duration;

/// 只在前几个包和每 100 个包打印一次
const LOG_FIRST_N: usize = 5;

/// 时间戳跳变后等待 flush 的上限；启动阶段的 flush 要等到进入播放状态才执行
const DISCONTINUITY_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct DemuxStats {
    packets: usize,
    video: usize,
    audio: usize,
    skipped: usize,
    dropped: usize,
}

/// 数据源线程主体
///
/// 读包并按类型送进音频 / 视频包队列（有界，满了就背压）。到达末尾后不退出，
/// 等待 seek 或停止；两个解码器都退出后才结束。
pub(crate) fn run(pipe: &Pipeline, mut demuxer: Box<dyn Demuxer>) -> Result<()> {
    info!("{} 🎬 数据源线程启动: {}", log_ctx(), demuxer.description());

    let info = demuxer.media_info().clone();
    if let Some(title) = info.title.clone() {
        pipe.notify(PlayerCtl::SetTitle(title));
    }
    pipe.notify(PlayerCtl::SetDuration(info.duration));
    pipe.stage_ready(Stage::StreamParse);

    let mut stats = DemuxStats::default();
    let result = loop {
        if pipe.is_stopping() {
            break Ok(());
        }
        pipe.stream_cp.here();
        if pipe.is_stopping() {
            break Ok(());
        }

        if let Some(pos) = pipe.take_pending_seek() {
            info!("{} ⏩ 数据源 seek 到 {}us", log_ctx(), pos);
            match demuxer.seek(pos) {
                Ok(()) => pipe.notify(PlayerCtl::SetPosition(pos)),
                Err(e) => error!("{} ❌ Seek 失败: {}", log_ctx(), e),
            }
            continue;
        }

        match demuxer.read_packet() {
            Ok(Some(DemuxEvent::Packet(packet))) => {
                if !route(pipe, packet, &mut stats) {
                    break Ok(());
                }
            }
            Ok(Some(DemuxEvent::Discontinuity)) => {
                // 跳变之后的包要等 flush 做完再读，否则会被一起清掉
                let generation = pipe.flush_generation();
                warn!("⚠️ {} 时间戳不连续，请求 flush", log_ctx());
                pipe.notify(PlayerCtl::Flush);
                if !pipe.wait_for_flush(generation, DISCONTINUITY_WAIT) && !pipe.is_stopping() {
                    warn!("⚠️ {} 等待 flush 超时，继续读取", log_ctx());
                }
            }
            Ok(None) => {
                info!("{} 📄 数据源到达末尾，等待 seek 或停止...", log_ctx());
                pipe.set_stream_eof(true);
                if !pipe.wait_after_eof() {
                    break Ok(());
                }
            }
            Err(e) => {
                error!("{} ❌ 读取包失败: {}", log_ctx(), e);
                break Err(e);
            }
        }
    };

    pipe.stream_cp.disable();
    info!(
        "{} 🛑 数据源线程退出（共读取 {} 个包：{} 视频，{} 音频，跳过 {}，丢弃 {}）",
        log_ctx(),
        stats.packets,
        stats.video,
        stats.audio,
        stats.skipped,
        stats.dropped
    );
    result
}

/// 把包送进对应的队列；队列已关闭时返回 false
fn route(pipe: &Pipeline, packet: Packet, stats: &mut DemuxStats) -> bool {
    stats.packets += 1;
    let queue = match packet.kind {
        Some(PacketKind::Video) if pipe.info.has_video => {
            stats.video += 1;
            if stats.video <= LOG_FIRST_N || stats.video % 100 == 0 {
                debug!("{} 📦 读取视频包 #{} pts={}us", log_ctx(), stats.video, packet.pts);
            }
            &pipe.video_packets
        }
        Some(PacketKind::Audio) if pipe.info.has_audio && packet.track == pipe.audio_track() => {
            stats.audio += 1;
            if stats.audio <= LOG_FIRST_N || stats.audio % 100 == 0 {
                debug!("{} 🔊 读取音频包 #{} pts={}us", log_ctx(), stats.audio, packet.pts);
            }
            &pipe.audio_packets
        }
        _ => {
            // 其他音轨 / 字幕 / 数据包
            stats.skipped += 1;
            return true;
        }
    };

    match pipe.push(queue, packet, &pipe.stream_cp, FlushFlags::empty()) {
        Push::Sent => true,
        Push::Dropped(_) => {
            stats.dropped += 1;
            true
        }
        Push::Closed(_) => false,
    }
}
