mod alsa_device;
mod capture;
mod config;
mod error;
mod pcm;
mod playback;
mod protocol;
mod session;
mod state_machine;
mod transport;

use config::Config;
use session::{SessionController, TranscriptLine};
use tokio::signal;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = Config::new().unwrap_or_default();

    // 客户端UUID，先从本地文件读取以保持重启间身份一致，如果不存在则生成新的并保存
    let uuid_file_path = "xiaoye_client_id.txt";
    if config.client_id == "unknown-client" {
        if let Ok(content) = std::fs::read_to_string(uuid_file_path) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                config.client_id = trimmed.to_string();
                log::info!("Loaded Client ID from file: {}", config.client_id);
            }
        }
    }

    // 生成新的UUID并保存
    if config.client_id == "unknown-client" {
        config.client_id = Uuid::new_v4().to_string();
        log::info!("Generated new Client ID: {}", config.client_id);
        if let Err(e) = std::fs::write(uuid_file_path, &config.client_id) {
            log::warn!("Failed to save Client ID to file: {}", e);
        }
    }

    // 聊天记录通道，文本转写发给调用方渲染
    let (transcript_tx, mut transcript_rx) = mpsc::channel::<TranscriptLine>(100);
    let (mut controller, mut status_rx) = SessionController::new(config, transcript_tx);

    // 开启会话：先取设备，再连服务器
    let (mut frame_rx, mut event_rx) = controller.start().await?;
    println!("Voice session open. Press Ctrl+C to hang up.");

    // 主事件循环：单一控制路径，采集帧和服务器事件都汇聚到这里
    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                controller.shutdown("stopped by user").await;
                break;
            }

            // 麦克风采集帧 → 编码 → 发送给服务器
            Some(frame) = frame_rx.recv() => {
                controller.handle_capture_frame(frame);
            }

            // 服务器事件 → 解码播放 / 打断 / 转写 / 结束
            Some(event) = event_rx.recv() => {
                if controller.handle_transport_event(event).await {
                    println!("Session ended.");
                    break;
                }
            }

            // 渲染文本转写（UI 占位）
            Some(line) = transcript_rx.recv() => {
                println!("[{}] {}", line.role, line.text);
            }

            // 连接状态变化
            Ok(()) = status_rx.changed() => {
                let connected = status_rx.borrow_and_update().connected;
                log::info!("Connection status: connected={}", connected);
            }
        }
    }
    Ok(())
}
