use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    /// API key for the chat-completion endpoint. Commentary falls back to a
    /// deterministic line when this is unset.
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_base_url: String,
    pub catalog_path: PathBuf,
    pub tts_base_url: String,
    pub rtmp_url: String,
    /// How many songs play between two commentary breaks.
    pub commentary_every_n_songs: u32,
    pub work_dir: PathBuf,
    pub liner_dir: Option<PathBuf>,
    pub station_name: String,
    pub station_id_wav: Option<PathBuf>,
    pub target_buffer_sec: f64,
    pub min_buffer_sec: f64,
    /// Timeline engine v2: schedule clips on the two-deck timeline and feed
    /// the sink with fixed rendered windows instead of whole segments.
    pub timeline_engine_v2: bool,
    /// Audio engine v2: run whole-segment renders through the mastering chain.
    pub audio_engine_v2: bool,
    /// Window length in seconds for the chunked renderer.
    pub master_window_sec: f64,
    /// Carry the commentary-bed offset into the following song. Ships off.
    pub carry_over_offset: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let catalog_path = env::var("RJ_CATALOG_PATH").map_err(|_| {
            anyhow::anyhow!("RJ_CATALOG_PATH environment variable must be set")
        })?;

        Ok(Config {
            server_port: env::var("RJ_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),
            llm_api_key: env::var("RJ_LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            llm_model: env::var("RJ_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_base_url: env::var("RJ_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            catalog_path: PathBuf::from(catalog_path),
            tts_base_url: env::var("RJ_TTS_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            rtmp_url: env::var("RJ_RTMP_URL")
                .unwrap_or_else(|_| "rtmp://localhost:1935/live/radio".to_string()),
            commentary_every_n_songs: env::var("RJ_COMMENTARY_EVERY_N_SONGS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(2),
            work_dir: PathBuf::from(
                env::var("RJ_WORK_DIR").unwrap_or_else(|_| "/tmp/rj".to_string()),
            ),
            liner_dir: env::var("RJ_LINER_DIR").ok().map(PathBuf::from),
            station_name: env::var("RJ_STATION_NAME")
                .unwrap_or_else(|_| "Radio Jockey".to_string()),
            station_id_wav: env::var("RJ_STATION_ID_WAV").ok().map(PathBuf::from),
            target_buffer_sec: parse_f64("RJ_TARGET_BUFFER_SEC", 600.0),
            min_buffer_sec: parse_f64("RJ_MIN_BUFFER_SEC", 180.0),
            timeline_engine_v2: parse_bool("RJ_TIMELINE_ENGINE_V2"),
            audio_engine_v2: parse_bool("RJ_AUDIO_ENGINE_V2"),
            master_window_sec: parse_f64("RJ_MASTER_WINDOW_SEC", 2.0),
            carry_over_offset: parse_bool("RJ_CARRY_OVER_OFFSET"),
        })
    }
}

fn parse_f64(var: &str, default: f64) -> f64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &f64| v.is_finite() && *v > 0.0)
        .unwrap_or(default)
}

fn parse_bool(var: &str) -> bool {
    matches!(
        env::var(var).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
