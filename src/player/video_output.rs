use super::pipeline::Pipeline;
use super::presenter::PresentCall;
use crate::core::{log_ctx, FlushFlags, QueueError, Result, Stage, VideoFrame};
use log::{error, info, trace};
use std::thread;
use std::time::Duration;

/// 帧还没到时间时单次最多等待多久，之后重新检查 flush / 暂停 / 停止
const MAX_WAIT: Duration = Duration::from_millis(10);
const EOF_POLL: Duration = Duration::from_millis(20);

/// 视频输出线程主体
///
/// 按主时钟呈现帧：早到的帧等待，迟到超过阈值的丢弃。画面属于呈现器的线程，
/// 每一帧都通过同一个可回收委托交过去，呈现完归还帧池。
pub(crate) fn run(pipe: &Pipeline) -> Result<()> {
    let presenter = pipe.presenter.clone();
    let call = PresentCall::recyclable(move |frame: VideoFrame| {
        let drawn = presenter.draw(&frame);
        (frame, drawn)
    });
    pipe.presenter.set_aspect_ratio(pipe.info.aspect_ratio);
    info!("{} 🖥️ 视频输出线程启动", log_ctx());
    pipe.stage_ready(Stage::VideoOutput);

    let late_threshold = pipe.config.late_frame_threshold_us;
    let mut presented = 0u64;
    let mut late = 0u64;
    let mut held: Option<(VideoFrame, u64)> = None;

    let result = loop {
        if pipe.is_stopping() {
            break Ok(());
        }
        pipe.video_output_cp.here();
        if pipe.is_stopping() {
            break Ok(());
        }

        let generation = pipe.flush_generation();
        let frame = match held.take() {
            Some((frame, g)) if g == generation => frame,
            Some((frame, _)) => {
                // flush 之前取出的帧
                pipe.frame_pool.put(frame);
                continue;
            }
            None => match pipe.video_frames.timed_get(EOF_POLL) {
                Ok(frame) => frame,
                Err(QueueError::WouldBlock) => {
                    if !pipe.decoders_running().contains(FlushFlags::VIDEO) && pipe.video_frames.is_empty() {
                        break Ok(());
                    }
                    continue;
                }
                Err(_) => break Ok(()),
            },
        };

        let delta = frame.pts - pipe.master_time();
        if delta > 0 {
            let wait = Duration::from_micros(delta as u64).min(MAX_WAIT);
            held = Some((frame, generation));
            thread::sleep(wait);
            continue;
        }
        if -delta > late_threshold {
            trace!("{} ⏭️ 丢弃迟到 {}us 的帧 pts={}us", log_ctx(), -delta, frame.pts);
            late += 1;
            pipe.frame_pool.put(frame);
            continue;
        }

        call.rearm(frame);
        if let Err(e) = pipe.presenter.delegate_to_owner(&call) {
            error!("{} ❌ 无法把帧交给画面线程: {}", log_ctx(), e);
            break Err(e);
        }
        let (frame, drawn) = match call.wait() {
            Ok(outcome) => outcome,
            Err(e) => break Err(e.into()),
        };
        pipe.frame_pool.put(frame);
        if let Err(e) = drawn {
            error!("{} ❌ 呈现失败: {}", log_ctx(), e);
            break Err(e);
        }
        presented += 1;
    };

    if let Some((frame, _)) = held {
        pipe.frame_pool.put(frame);
    }
    pipe.video_output_cp.disable();
    info!("{} 🛑 视频输出线程退出（呈现 {} 帧，丢弃迟到帧 {}）", log_ctx(), presented, late);
    result
}
