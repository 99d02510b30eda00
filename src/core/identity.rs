use crate::domain::ports::IdentityPolicy;
use rand::seq::SliceRandom;

pub const DEFAULT_USER_AGENTS: [&str; 6] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// 每次呼叫都從固定清單中隨機挑選 user agent
#[derive(Debug, Clone)]
pub struct RotatingIdentity {
    pool: Vec<String>,
}

impl RotatingIdentity {
    /// 清單為空時使用內建的桌面版 user agent
    pub fn new(pool: Vec<String>) -> Self {
        if pool.is_empty() {
            return Self::default();
        }
        Self { pool }
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }
}

impl Default for RotatingIdentity {
    fn default() -> Self {
        Self {
            pool: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
        }
    }
}

impl IdentityPolicy for RotatingIdentity {
    fn user_agent(&self) -> String {
        self.pool
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENTS[0].to_string())
    }
}

/// 固定使用同一個 user agent
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub String);

impl IdentityPolicy for FixedIdentity {
    fn user_agent(&self) -> String {
        self.0.clone()
    }
}
