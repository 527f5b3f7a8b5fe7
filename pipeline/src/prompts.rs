//! Stage prompt construction
//!
//! Each stage turns the job configuration plus its upstream outputs into one
//! JSON-mode completion request carrying the job priority.

use shared::{ChatMessage, CompletionRequest, ResponseFormat};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{DraftOutput, OptimizedOutput, PipelineJob, ResearchOutput, SelectOutput, Stage};

/// Upstream outputs available to a stage
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    pub select: Option<SelectOutput>,
    pub research: Option<ResearchOutput>,
    pub draft: Option<DraftOutput>,
    pub optimized: Option<OptimizedOutput>,
}

impl StageInputs {
    fn require<'a, T>(value: &'a Option<T>, stage: Stage, missing: Stage) -> PipelineResult<&'a T> {
        value
            .as_ref()
            .ok_or(PipelineError::DependencyMissing { stage, missing })
    }
}

fn exclusions(job: &PipelineJob) -> String {
    if job.used_content_hashes.is_empty() {
        "none".to_string()
    } else {
        job.used_content_hashes.join(", ")
    }
}

fn system_prompt(stage: Stage, job: &PipelineJob) -> String {
    match stage {
        Stage::Select => "You plan content strategy. Reply with a single JSON object.".to_string(),
        Stage::Research => "You research topics for writers. Reply with a single JSON object.".to_string(),
        Stage::Write => format!(
            "You write content in a {} voice. Reply with a single JSON object.",
            job.config.voice.trait_name
        ),
        Stage::Optimize => "You optimize content for search and engagement. Reply with a single JSON object.".to_string(),
        Stage::Validate => "You review content before publication. Reply with a single JSON object.".to_string(),
    }
}

fn user_prompt(stage: Stage, job: &PipelineJob, inputs: &StageInputs) -> PipelineResult<String> {
    let content = &job.config.content;

    let prompt = match stage {
        Stage::Select => format!(
            "Choose one theme for a {format} about {pillar} for {audience}.\n\
             Do not reuse any of these content hashes: {excluded}\n\
             Brand context: {brand}\n\
             Return {{\"theme_id\": str, \"theme_title\": str, \"angle\": str, \"content_hash\": str}}.",
            format = content.content_format,
            pillar = content.pillar,
            audience = content.target_audience,
            excluded = exclusions(job),
            brand = job.config.brand_context,
        ),
        Stage::Research => {
            let select = StageInputs::require(&inputs.select, stage, Stage::Select)?;
            format!(
                "Gather supporting material for the theme \"{}\" from the angle \"{}\" aimed at {}.\n\
                 Return key insights, figures and talking points as JSON.",
                select.theme_title, select.angle, content.target_audience
            )
        }
        Stage::Write => {
            let select = StageInputs::require(&inputs.select, stage, Stage::Select)?;
            let research = StageInputs::require(&inputs.research, stage, Stage::Research)?;
            let voice = &job.config.voice;
            format!(
                "Write a {format} of about {words} words in {language} on \"{title}\".\n\
                 Research: {research}\n\
                 Goal: {goal}. Humor {humor}/10, formality {formality}/10, emoji allowed: {emoji}.\n\
                 Return the full piece and its metadata as JSON.",
                format = content.content_format,
                words = content.word_count_target,
                language = content.language,
                title = select.theme_title,
                research = research.0,
                goal = content.engagement_goal,
                humor = voice.humor_level,
                formality = voice.formality,
                emoji = voice.use_emoji,
            )
        }
        Stage::Optimize => {
            let draft = StageInputs::require(&inputs.draft, stage, Stage::Write)?;
            format!(
                "Improve this draft for discoverability and engagement and score it:\n{}\n\
                 Return the optimized content and its scores as JSON.",
                draft.0
            )
        }
        Stage::Validate => {
            let optimized = StageInputs::require(&inputs.optimized, stage, Stage::Optimize)?;
            format!(
                "Check this content is complete, meets its score thresholds and does not repeat any of: {}\n{}\n\
                 Return {{\"valid\": bool, \"issues\": [str]}}.",
                exclusions(job),
                optimized.0
            )
        }
    };

    Ok(prompt)
}

/// Completion request for one stage of a job
pub fn build_request(stage: Stage, job: &PipelineJob, inputs: &StageInputs) -> PipelineResult<CompletionRequest> {
    let messages = vec![
        ChatMessage::system(system_prompt(stage, job)),
        ChatMessage::user(user_prompt(stage, job, inputs)?),
    ];

    Ok(CompletionRequest::new(messages)
        .with_temperature(stage.temperature())
        .with_max_tokens(stage.max_tokens())
        .with_response_format(ResponseFormat::JsonObject)
        .with_priority(job.priority)
        .with_label(format!("{}:{}", job.id, stage)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentConfig, JobConfig, JobId};
    use chrono::Utc;
    use serde_json::json;
    use shared::Priority;

    fn job(stage: Stage) -> PipelineJob {
        PipelineJob {
            id: JobId::new(),
            stage,
            config: JobConfig::new(ContentConfig::new("productivity", "founders")),
            used_content_hashes: vec!["h1".into(), "h2".into()],
            priority: Priority::new(8),
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_select_request_parameters() {
        let job = job(Stage::Select);
        let request = build_request(Stage::Select, &job, &StageInputs::default()).unwrap();

        assert_eq!(request.temperature, 0.6);
        assert_eq!(request.max_tokens, 500);
        assert_eq!(request.priority, Priority::new(8));
        assert_eq!(request.response_format, Some(ResponseFormat::JsonObject));
        assert_eq!(request.label.as_deref(), Some(format!("{}:SELECT", job.id).as_str()));
        assert!(request.messages[1].content.contains("h1, h2"));
    }

    #[test]
    fn test_write_needs_select_and_research() {
        let job = job(Stage::Write);
        let mut inputs = StageInputs {
            select: Some(SelectOutput {
                theme_id: "t".into(),
                theme_title: "Deep work".into(),
                angle: "mornings".into(),
                content_hash: "h3".into(),
            }),
            ..StageInputs::default()
        };

        assert!(matches!(
            build_request(Stage::Write, &job, &inputs),
            Err(PipelineError::DependencyMissing { stage: Stage::Write, missing: Stage::Research })
        ));

        inputs.research = Some(ResearchOutput(json!({ "insights": ["focus blocks"] })));
        let request = build_request(Stage::Write, &job, &inputs).unwrap();
        assert_eq!(request.max_tokens, 4000);
        assert!(request.messages[1].content.contains("focus blocks"));
    }

    #[test]
    fn test_every_stage_has_its_own_parameters() {
        let temps: Vec<f32> = Stage::ALL.iter().map(|s| s.temperature()).collect();
        let tokens: Vec<u32> = Stage::ALL.iter().map(|s| s.max_tokens()).collect();
        assert_eq!(temps, vec![0.6, 0.5, 0.7, 0.4, 0.3]);
        assert_eq!(tokens, vec![500, 800, 4000, 2000, 500]);
    }
}
