// Adapters 層：domain ports 的具體實作（瀏覽器、HTTP 與測試替身）

#[cfg(feature = "browser")]
pub mod chromium;
pub mod http;
pub mod scripted;
