#[derive(Debug, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: String,
    pub api_token: &'static str,

    // 客户端标识（动态部分，可在运行时修改）
    pub client_id: String,

    // 会话配置
    pub model: &'static str,
    pub voice: &'static str,

    // 音频配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub frame_samples: usize,
    pub channel_capacity: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            api_token: env!("API_TOKEN"),

            // 客户端标识初始化为config.toml中的值
            client_id: env!("CLIENT_ID").to_string(),

            model: env!("SESSION_MODEL"),
            voice: env!("SESSION_VOICE"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            frame_samples: env!("FRAME_SAMPLES").parse()
                .map_err(|_| "Failed to parse FRAME_SAMPLES")?,
            channel_capacity: env!("CHANNEL_CAPACITY").parse()
                .map_err(|_| "Failed to parse CHANNEL_CAPACITY")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
