//! 当前时间能力：本地时间 + 星期，模型换算「十分钟后」之类的相对时间时需要它

use async_trait::async_trait;
use chrono::{Datelike, Local};
use serde_json::{Map, Value};

use crate::tools::{Capability, CapabilityError};

const WEEKDAYS: [&str; 7] = ["周一", "周二", "周三", "周四", "周五", "周六", "周日"];

pub struct CurrentTimeTool;

#[async_trait]
impl Capability for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current local date and time (YYYY-MM-DD HH:MM:SS) with weekday."
    }

    async fn invoke(&self, _args: Map<String, Value>) -> Result<Value, CapabilityError> {
        let now = Local::now();
        let weekday = WEEKDAYS[now.weekday().num_days_from_monday() as usize];
        Ok(serde_json::json!({
            "local_time": now.format("%Y-%m-%d %H:%M:%S").to_string(),
            "weekday": weekday,
            "utc_offset": now.format("%:z").to_string(),
        }))
    }
}
