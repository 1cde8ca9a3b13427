//! System prompt builder
//!
//! One instruction block per call, assembled in a fixed section order:
//! base persona, AI identity (soul), memory, task, skills, tools, and the
//! output format for extraction.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::skills::Skill;
use crate::tools::ToolInfo;

/// Base persona used when no `Agent.md` is configured
pub const DEFAULT_AGENT_PROMPT: &str = "你是一个智能笔记助手，帮助用户整理和回顾语音/文字记录。";

/// Conversation flavour of a chat session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Review past records with the user
    #[default]
    Review,
    /// Carry out note-management instructions
    Command,
}

/// What the prompt is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Structured extraction, JSON output
    Process,
    /// Free-form streaming dialogue
    Chat(ChatMode),
}

/// Inputs of [`build_system_prompt`]
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub base: &'a str,
    pub skills: &'a [Skill],
    pub soul: Option<&'a str>,
    pub memory: &'a [String],
    pub mode: PromptMode,
    /// Tags the model may choose from (process mode)
    pub existing_tags: &'a [String],
    pub tools: &'a [ToolInfo],
}

impl<'a> PromptContext<'a> {
    /// Context with only a base persona and mode set
    #[must_use]
    pub const fn new(base: &'a str, mode: PromptMode) -> Self {
        Self {
            base,
            skills: &[],
            soul: None,
            memory: &[],
            mode,
            existing_tags: &[],
            tools: &[],
        }
    }
}

/// Read the base persona file, falling back to [`DEFAULT_AGENT_PROMPT`]
#[must_use]
pub fn load_agent_prompt(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return DEFAULT_AGENT_PROMPT.to_string();
    };

    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => {
            tracing::info!(path = %path.display(), "loaded agent prompt");
            content
        }
        Ok(_) => DEFAULT_AGENT_PROMPT.to_string(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read agent prompt, using default");
            DEFAULT_AGENT_PROMPT.to_string()
        }
    }
}

/// Build the system prompt
#[must_use]
pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut parts: Vec<String> = vec![ctx.base.to_string()];

    if let Some(soul) = ctx.soul.filter(|s| !s.is_empty()) {
        parts.push(format!("\n## AI 身份定义\n{soul}"));
    }

    if !ctx.memory.is_empty() {
        parts.push(format!("\n## 相关记忆\n{}", ctx.memory.join("\n")));
    }

    match ctx.mode {
        PromptMode::Process => {
            parts.push(
                "\n## 任务\n分析以下记录内容，按照激活的技能进行提取。你必须且只能返回一个合法的 JSON 对象，不要包含任何 markdown 代码块标记、注释或额外文字。"
                    .to_string(),
            );
            parts.push(CLEANUP_RULES.to_string());
            parts.push(tag_rules(ctx.existing_tags));
        }
        PromptMode::Chat(ChatMode::Review) => {
            parts.push(
                "\n## 任务\n你正在与用户进行复盘对话。基于记忆和用户画像，帮助用户回顾和总结。自然地对话，按需提出问题和洞察。"
                    .to_string(),
            );
        }
        PromptMode::Chat(ChatMode::Command) => {
            parts.push(
                "\n## 任务\n你正在根据用户的指令协助整理笔记。简洁地完成用户的请求，必要时说明结果。"
                    .to_string(),
            );
        }
    }

    if !ctx.skills.is_empty() {
        parts.push("\n## 激活的技能".to_string());
        for skill in ctx.skills {
            parts.push(format!("\n### {}\n{}", skill.name, skill.instructions));
        }
    }

    if !ctx.tools.is_empty() {
        parts.push(
            "\n## 可用工具\n你可以调用以下工具来获取外部信息。如需使用工具，在 JSON 响应中添加 \"tool_calls\" 字段。"
                .to_string(),
        );
        for tool in ctx.tools {
            parts.push(format!("\n### {}\n{}", tool.name, tool.description));
            if let Some(schema) = &tool.input_schema {
                parts.push(format!("参数: {schema}"));
            }
        }
        parts.push(
            "\n工具调用格式：\n\"tool_calls\": [{\"name\": \"工具名\", \"arguments\": {...}}]"
                .to_string(),
        );
    }

    if ctx.mode == PromptMode::Process {
        parts.push(output_format(ctx.skills, !ctx.tools.is_empty()));
    }

    parts.join("\n")
}

const CLEANUP_RULES: &str = "\n## 转写清理规则\n对输入文本进行最小化清理，生成 summary 字段：\n- 移除口语填充词：嗯、啊、那个、就是说、然后呢、对吧、你知道吗、这个、额、哦、呃\n- 移除重复词和无意义的语气词\n- 修正明显的错别字和语音识别错误\n- 严格保留原文的表述结构：短句还是短句，倒装还是倒装，不要改写句式\n- 不要将口语转为书面语，不要合并或拆分句子\n- 不添加或删减实质内容";

fn tag_rules(existing_tags: &[String]) -> String {
    if existing_tags.is_empty() {
        return "\n## 标签规则\ntags 返回空数组 []，不要创建任何标签。".to_string();
    }

    let list = existing_tags
        .iter()
        .map(|t| format!("- \"{t}\""))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "\n## 标签规则\n只能从以下已有标签中选择匹配的标签，**不要创建新标签**：\n{list}\n如果没有合适的标签匹配，tags 返回空数组 []。"
    )
}

/// Requested extraction fields across skills, first occurrence order
fn extract_fields(skills: &[Skill]) -> Vec<&str> {
    let mut fields: Vec<&str> = Vec::new();
    for field in skills.iter().flat_map(|s| &s.metadata.extract_fields) {
        if !fields.contains(&field.as_str()) {
            fields.push(field);
        }
    }
    fields
}

fn output_format(skills: &[Skill], has_tools: bool) -> String {
    let fields = extract_fields(skills);
    let Some(first) = fields.first() else {
        return "\n## 输出格式\n返回严格的 JSON 对象：\n{\"summary\": \"\", \"todos\": [], \"customer_requests\": [], \"setting_changes\": [], \"tags\": []}\n如果某个字段没有相关内容，返回空数组。".to_string();
    };

    let mut out = String::from(
        "\n## 输出格式\n返回严格的 JSON 对象（不要用 ```json 包裹），包含以下字段：\n- \"summary\": string：清理后的转写文本（仅去填充词和修错别字，保留原文结构）",
    );
    for field in &fields {
        let _ = write!(out, "\n- \"{field}\": string[]：提取的{field}列表");
    }
    out.push_str("\n- \"tags\": string[]：从已有标签中匹配的标签");
    if has_tools {
        out.push_str("\n- \"tool_calls\": object[]：(可选) 需要调用的工具");
    }
    out.push_str("\n\n如果某个字段没有相关内容，返回空数组 []。不要包含额外的字段或注释。");
    let _ = write!(
        out,
        "\n\n示例输出：\n{{\"summary\": \"...\", \"{first}\": [], \"tags\": []}}"
    );
    out
}
