use serde::Serialize;

/// Runtime configuration, loaded once at startup from the environment.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub pool_size: usize,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub container_image: String,
    pub session_duration_secs: u64,
    pub rate_limit_per_day: u32,
    pub frontend_url: String,
    pub admin_user: String,
    #[serde(skip_serializing)]
    pub admin_password: String,
    pub data_dir: String,
    pub shm_size_bytes: i64,
    pub memory_limit_bytes: i64,
    pub cpu_limit: f64,
    pub stream_port: u16,
    pub mounts_dir: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            pool_size: env_parse("POOL_SIZE", 3),
            port_range_start: env_parse("PORT_RANGE_START", 4000),
            port_range_end: env_parse("PORT_RANGE_END", 4100),
            container_image: std::env::var("CONTAINER_IMAGE")
                .unwrap_or_else(|_| "cloudbrowser-kiosk:latest".to_string()),
            session_duration_secs: env_parse("SESSION_DURATION", 300),
            rate_limit_per_day: env_parse("RATE_LIMIT_PER_DAY", 10),
            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            admin_user: std::env::var("ADMIN_USER").unwrap_or_else(|_| "admin".to_string()),
            admin_password: std::env::var("ADMIN_PASSWORD").unwrap_or_default(),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            shm_size_bytes: env_parse("SHM_SIZE", 2 * 1024 * 1024 * 1024),
            memory_limit_bytes: env_parse("CONTAINER_MEMORY_LIMIT", 2 * 1024 * 1024 * 1024),
            cpu_limit: env_parse("CONTAINER_CPU_LIMIT", 2.0),
            stream_port: env_parse("STREAM_PORT", 8080),
            mounts_dir: std::env::var("CONTAINER_MOUNTS_DIR").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("CB_TEST_BOGUS", "not-a-number");
        assert_eq!(env_parse("CB_TEST_BOGUS", 7u32), 7);
        std::env::remove_var("CB_TEST_BOGUS");
    }
}
