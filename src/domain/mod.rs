// 領域層：擷取資料模型與核心使用的 ports

pub mod model;
pub mod ports;
