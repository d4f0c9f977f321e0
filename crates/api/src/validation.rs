use validator::ValidationError;

/// 验证任务标题格式
pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::new("empty_title").with_message("任务标题不能为空".into()));
    }

    if title.len() > 255 {
        return Err(ValidationError::new("title_too_long")
            .with_message("任务标题长度不能超过255个字符".into()));
    }

    if title.starts_with(' ') || title.ends_with(' ') {
        return Err(ValidationError::new("title_whitespace")
            .with_message("任务标题不能以空格开头或结尾".into()));
    }

    Ok(())
}

/// 验证任务类型格式：字母、数字、下划线、点、连字符
pub fn validate_task_type(task_type: &str) -> Result<(), ValidationError> {
    if task_type.trim().is_empty() {
        return Err(ValidationError::new("empty_task_type").with_message("任务类型不能为空".into()));
    }

    if task_type.len() > 100 {
        return Err(ValidationError::new("task_type_too_long")
            .with_message("任务类型长度不能超过100个字符".into()));
    }

    if !task_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(ValidationError::new("task_type_charset")
            .with_message("任务类型只能包含字母、数字、下划线、点和连字符".into()));
    }

    Ok(())
}

/// 验证任务配置：大小上限1MB，cost_estimate若提供必须非负
pub fn validate_task_config(config: &serde_json::Value) -> Result<(), ValidationError> {
    if config.to_string().len() > 1024 * 1024 {
        return Err(
            ValidationError::new("config_too_large").with_message("任务配置大小不能超过1MB".into())
        );
    }

    if let Some(estimate) = config.get("cost_estimate") {
        match estimate.as_f64() {
            Some(v) if v >= 0.0 => {}
            _ => {
                return Err(ValidationError::new("invalid_cost_estimate")
                    .with_message("cost_estimate必须是非负数".into()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_title() {
        assert!(validate_title("训练任务").is_ok());
        assert!(validate_title("").is_err());
        assert!(validate_title("  ").is_err());
        assert!(validate_title(" 开头空格").is_err());
        assert!(validate_title(&"长".repeat(100)).is_err()); // 300字节
    }

    #[test]
    fn test_validate_task_type() {
        assert!(validate_task_type("training").is_ok());
        assert!(validate_task_type("data_processing-v2.1").is_ok());
        assert!(validate_task_type("").is_err());
        assert!(validate_task_type("训练").is_err());
        assert!(validate_task_type("bad type").is_err());
    }

    #[test]
    fn test_validate_task_config() {
        assert!(validate_task_config(&json!({})).is_ok());
        assert!(validate_task_config(&json!({ "cost_estimate": 2.5 })).is_ok());
        assert!(validate_task_config(&json!({ "cost_estimate": -1.0 })).is_err());
        assert!(validate_task_config(&json!({ "cost_estimate": "很多" })).is_err());
    }
}
