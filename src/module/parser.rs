//! 模块描述解析器
//!
//! 负责从 module.yaml（或 module.json）解析并校验模块描述。

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::module::metadata::{parse_version_req, ModuleDescriptor};
use crate::utils::{CoreError, Result};

/// 模块描述文件名（YAML）
pub const DESCRIPTOR_FILE: &str = "module.yaml";
/// 模块描述文件名（JSON）
pub const DESCRIPTOR_FILE_JSON: &str = "module.json";

/// 符号名格式：字母或下划线开头，由字母、数字、下划线、连字符和点组成
///
/// 例如 `chips.editor`、`chips-text_core`
static SYMBOLIC_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*(\.[A-Za-z_][A-Za-z0-9_\-]*)*$")
        .expect("Invalid symbolic name regex")
});

/// 模块描述解析器
#[derive(Debug, Clone, Default)]
pub struct ModuleParser;

impl ModuleParser {
    /// 从模块目录解析描述
    ///
    /// 优先读取 `module.yaml`，不存在时读取 `module.json`。
    ///
    /// # Errors
    ///
    /// - 两个描述文件都不存在时返回 `InvalidMetadata`
    /// - 解析或校验失败时返回对应错误
    pub async fn parse_dir(dir: &Path) -> Result<ModuleDescriptor> {
        let yaml = dir.join(DESCRIPTOR_FILE);
        if tokio::fs::try_exists(&yaml).await.unwrap_or(false) {
            return Self::parse_file(&yaml).await;
        }
        let json = dir.join(DESCRIPTOR_FILE_JSON);
        if tokio::fs::try_exists(&json).await.unwrap_or(false) {
            return Self::parse_file(&json).await;
        }
        Err(CoreError::InvalidMetadata(format!(
            "目录 {} 中没有 {} 或 {}",
            dir.display(),
            DESCRIPTOR_FILE,
            DESCRIPTOR_FILE_JSON
        )))
    }

    /// 从文件解析模块描述，`.json` 扩展名按 JSON 解析
    ///
    /// # Arguments
    ///
    /// * `path` - 描述文件路径
    ///
    /// # Returns
    ///
    /// 校验通过的 `ModuleDescriptor`
    pub async fn parse_file(path: &Path) -> Result<ModuleDescriptor> {
        let content = tokio::fs::read_to_string(path).await?;
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            Self::parse_json(&content)
        } else {
            Self::parse_str(&content)
        }
    }

    /// 从 YAML 字符串解析
    pub fn parse_str(content: &str) -> Result<ModuleDescriptor> {
        let descriptor: ModuleDescriptor = serde_yaml::from_str(content)?;
        Self::validate(&descriptor)?;
        Ok(descriptor)
    }

    /// 从 JSON 字符串解析
    pub fn parse_json(content: &str) -> Result<ModuleDescriptor> {
        let descriptor: ModuleDescriptor = serde_json::from_str(content)?;
        Self::validate(&descriptor)?;
        Ok(descriptor)
    }

    /// 校验模块描述
    ///
    /// 收集全部问题后一次性返回，错误信息用 "; " 连接：
    /// - 符号名格式（匿名模块跳过）
    /// - 版本号为 semver
    /// - 导入、依赖和片段宿主的版本范围
    /// - 片段不能声明激活器
    pub fn validate(descriptor: &ModuleDescriptor) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let Some(ref name) = descriptor.symbolic_name {
            if !SYMBOLIC_NAME_REGEX.is_match(name) {
                errors.push(format!("符号名 '{}' 格式无效", name));
            }
        }

        if semver::Version::parse(&descriptor.version).is_err() {
            errors.push(format!(
                "无效的版本号格式 '{}', 请使用 semver 格式 (如 1.0.0)",
                descriptor.version
            ));
        }

        for export in &descriptor.exports {
            if export.name.is_empty() {
                errors.push("导出包名不能为空".to_string());
            }
            if semver::Version::parse(&export.version).is_err() {
                errors.push(format!(
                    "导出包 '{}' 的版本格式无效: '{}'",
                    export.name, export.version
                ));
            }
        }

        for import in &descriptor.imports {
            if import.name.is_empty() {
                errors.push("导入包名不能为空".to_string());
            }
            if parse_version_req(&import.version).is_none() {
                errors.push(format!(
                    "导入包 '{}' 的版本范围无效: '{}'",
                    import.name, import.version
                ));
            }
        }

        for (index, requirement) in descriptor.requires.iter().enumerate() {
            if requirement.symbolic_name.is_empty() {
                errors.push(format!("第 {} 个依赖的符号名不能为空", index + 1));
            }
            if parse_version_req(&requirement.version).is_none() {
                errors.push(format!(
                    "依赖 '{}' 的版本范围无效: '{}'",
                    requirement.symbolic_name, requirement.version
                ));
            }
        }

        if let Some(ref host) = descriptor.fragment_host {
            if parse_version_req(&host.version).is_none() {
                errors.push(format!("片段宿主版本范围无效: '{}'", host.version));
            }
            if descriptor.symbolic_name.is_none() {
                errors.push("片段必须有符号名".to_string());
            }
            if descriptor.activator.is_some() {
                errors.push("片段不能声明激活器".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidMetadata(errors.join("; ")))
        }
    }
}
