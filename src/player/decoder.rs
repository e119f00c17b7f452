use super::audio_output::AudioSink;
use super::pipeline::{Pipeline, Push};
use crate::core::{log_ctx, FlushFlags, Packet, QueueError, Result, Stage};
use crate::dispatch::Mailbox;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;

/// 等包的超时；超时后检查是否已到末尾
const EOF_POLL: Duration = Duration::from_millis(20);

/// 取下一个包
///
/// - Ok(Some(packet)): 取到一个包
/// - Ok(None): 暂时没有，回到循环开头（检查点 / flush / 停止）
/// - Err(()): 队列已关闭，或数据源已经读完且队列为空
fn next_packet(pipe: &Pipeline, queue: &Mailbox<Packet>) -> std::result::Result<Option<Packet>, ()> {
    match queue.timed_get(EOF_POLL) {
        Ok(packet) => Ok(Some(packet)),
        Err(QueueError::WouldBlock) => {
            if pipe.is_stream_eof() && queue.is_empty() {
                Err(())
            } else {
                Ok(None)
            }
        }
        Err(_) => Err(()),
    }
}

/// 等音频输出播完；期间发生 flush 返回 false
fn drain_audio(pipe: &Pipeline, sink: &Arc<dyn AudioSink>) -> bool {
    loop {
        if sink.drain(EOF_POLL) || pipe.is_stopping() {
            return true;
        }
        if pipe.flush_pending(FlushFlags::AUDIO) {
            return false;
        }
    }
}

/// 音频解码线程主体
///
/// 在本线程上创建解码器和音频输出，准备好后通知播放器。输出由播放器在
/// AUDIOOUT 阶段启动，在那之前写入只会填满缓冲。
pub(crate) fn run_audio(pipe: &Pipeline) -> Result<()> {
    let mut track = pipe.audio_track();
    let mut decoder = pipe.backend.audio_decoder(&pipe.info, track)?;
    let sink = pipe.backend.audio_sink(&pipe.info, &pipe.config)?;
    pipe.set_sink(sink.clone());
    info!("{} 🔊 音频解码线程启动（音轨 {}）", log_ctx(), track);
    pipe.stage_ready(Stage::AudioDecode);

    let mut decoded = 0u64;
    let result = loop {
        if pipe.is_stopping() {
            break Ok(());
        }
        pipe.audio_decode_cp.here();

        if pipe.flush_pending(FlushFlags::AUDIO) {
            let dropped = pipe.discard_packets(&pipe.audio_packets);
            decoder.flush();
            sink.drop_samples();
            if pipe.audio_track() != track {
                track = pipe.audio_track();
                decoder = match pipe.backend.audio_decoder(&pipe.info, track) {
                    Ok(d) => d,
                    Err(e) => break Err(e),
                };
                info!("{} 🔀 切换到音轨 {}", log_ctx(), track);
            }
            debug!("{} 🚿 音频解码器已清空（丢弃 {} 个包）", log_ctx(), dropped);
            pipe.mark_flushed(FlushFlags::AUDIO);
            continue;
        }

        let packet = match next_packet(pipe, &pipe.audio_packets) {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(()) => {
                if pipe.is_stopping() || drain_audio(pipe, &sink) {
                    break Ok(());
                }
                continue;
            }
        };

        let frames = match decoder.decode(&packet) {
            Ok(frames) => frames,
            Err(e) => {
                error!("{} ❌ 音频解码失败: {}", log_ctx(), e);
                break Err(e);
            }
        };
        let mut failed = None;
        for frame in &frames {
            if pipe.is_stopping() || pipe.flush_pending(FlushFlags::AUDIO) {
                break;
            }
            if let Err(e) = sink.write(frame) {
                if !pipe.is_stopping() {
                    failed = Some(e);
                }
                break;
            }
            decoded += 1;
        }
        if let Some(e) = failed {
            error!("{} ❌ 音频输出失败: {}", log_ctx(), e);
            break Err(e);
        }
    };

    pipe.decoder_exited(FlushFlags::AUDIO);
    pipe.audio_decode_cp.disable();
    info!("{} 🛑 音频解码线程退出（共解码 {} 帧）", log_ctx(), decoded);
    result
}

/// 视频解码线程主体：解码后的帧从帧池取，送进视频帧队列
pub(crate) fn run_video(pipe: &Pipeline) -> Result<()> {
    let mut decoder = pipe.backend.video_decoder(&pipe.info, pipe.frame_pool.clone())?;
    info!(
        "{} 🎞️ 视频解码线程启动（{}x{} @ {:.2}fps）",
        log_ctx(),
        pipe.info.width,
        pipe.info.height,
        pipe.info.fps
    );
    pipe.stage_ready(Stage::VideoDecode);

    let mut decoded = 0u64;
    let mut dropped = 0u64;
    let result = 'decode: loop {
        if pipe.is_stopping() {
            break Ok(());
        }
        pipe.video_decode_cp.here();

        if pipe.flush_pending(FlushFlags::VIDEO) {
            let packets = pipe.discard_packets(&pipe.video_packets);
            decoder.flush();
            debug!("{} 🚿 视频解码器已清空（丢弃 {} 个包）", log_ctx(), packets);
            pipe.mark_flushed(FlushFlags::VIDEO);
            continue;
        }

        let packet = match next_packet(pipe, &pipe.video_packets) {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(()) => break Ok(()),
        };

        let frames = match decoder.decode(&packet) {
            Ok(frames) => frames,
            Err(e) => {
                error!("{} ❌ 视频解码失败: {}", log_ctx(), e);
                break Err(e);
            }
        };
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            match pipe.push(&pipe.video_frames, frame, &pipe.video_decode_cp, FlushFlags::VIDEO) {
                Push::Sent => decoded += 1,
                Push::Dropped(frame) => {
                    // 这一批剩下的帧也过时了
                    pipe.frame_pool.put(frame);
                    for rest in frames.by_ref() {
                        pipe.frame_pool.put(rest);
                    }
                    dropped += 1;
                }
                Push::Closed(frame) => {
                    pipe.frame_pool.put(frame);
                    break 'decode Ok(());
                }
            }
        }
    };

    pipe.decoder_exited(FlushFlags::VIDEO);
    pipe.video_decode_cp.disable();
    info!("{} 🛑 视频解码线程退出（共解码 {} 帧，丢弃 {} 批）", log_ctx(), decoded, dropped);
    result
}
