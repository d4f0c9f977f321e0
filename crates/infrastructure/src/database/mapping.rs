use gpu_scheduler_domain::{SchedulerError, SchedulerResult};

/// JSON列以TEXT存储，读写时在此统一序列化
pub struct MappingHelpers;

impl MappingHelpers {
    pub fn json_to_text(value: &serde_json::Value) -> SchedulerResult<String> {
        serde_json::to_string(value)
            .map_err(|e| SchedulerError::Serialization(format!("序列化JSON列失败: {e}")))
    }

    pub fn opt_json_to_text(value: &Option<serde_json::Value>) -> SchedulerResult<Option<String>> {
        value.as_ref().map(Self::json_to_text).transpose()
    }

    pub fn text_to_json(text: &str) -> SchedulerResult<serde_json::Value> {
        serde_json::from_str(text)
            .map_err(|e| SchedulerError::Serialization(format!("解析JSON列失败: {e}")))
    }

    pub fn opt_text_to_json(text: Option<String>) -> SchedulerResult<Option<serde_json::Value>> {
        text.as_deref().map(Self::text_to_json).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_text_roundtrip() {
        let value = json!({ "cost_estimate": 5.0, "epochs": 10 });
        let text = MappingHelpers::json_to_text(&value).unwrap();
        assert_eq!(MappingHelpers::text_to_json(&text).unwrap(), value);
    }

    #[test]
    fn test_opt_text_to_json() {
        assert_eq!(MappingHelpers::opt_text_to_json(None).unwrap(), None);
        assert!(MappingHelpers::opt_text_to_json(Some("不是json".to_string())).is_err());
    }
}
