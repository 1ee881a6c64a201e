use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    session: Session,
    audio: Audio,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    api_token: String,
    client_id: String,
}

#[derive(Deserialize)]
struct Session {
    model: String,
    voice: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    frame_samples: usize,
    channel_capacity: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=API_TOKEN={}", config.network.api_token);
    println!("cargo:rustc-env=CLIENT_ID={}", config.network.client_id);

    // 会话配置
    println!("cargo:rustc-env=SESSION_MODEL={}", config.session.model);
    println!("cargo:rustc-env=SESSION_VOICE={}", config.session.voice);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=FRAME_SAMPLES={}", config.audio.frame_samples);
    println!("cargo:rustc-env=CHANNEL_CAPACITY={}", config.audio.channel_capacity);
}
