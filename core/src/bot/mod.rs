//! Bot runtime
//!
//! An [`LlmBot`] plays one participant slot: it reads the participant's
//! current page, asks its model for answers, submits them, and repeats until
//! the platform reports there are no more pages. Every turn is written to the
//! session's [`ConversationStore`].

pub mod answer;
pub mod store;

pub use answer::{AnswerEntry, BotReply};
pub use store::{BotParams, ConversationRecord, ConversationStore, ParticipantRecord};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{sleep, Duration, Instant};

use crate::config::{BotSettings, LabConfig, ModelSpec};
use crate::error::{LabError, Result};
use crate::llm::{ChatMessage, ChatModel, ChatRequest, LlmClient, LlmConfig};
use crate::otree::{PageKind, PageSnapshot, ParticipantBrowser};
use crate::paradigm::PromptSet;
use crate::rate_limiter::RateLimiter;

/// Attempts per page before the bot gives up
pub const MAX_ANSWER_ATTEMPTS: usize = 3;

/// Everything needed to start a bot on one participant slot
#[derive(Debug, Clone)]
pub struct BotTask {
    pub session_code: String,
    pub participant_code: String,
    pub player_id: u32,
    pub url: String,
    pub model: ModelSpec,
    pub role: Option<String>,
    pub prompts: PromptSet,
    pub store: ConversationStore,
}

impl BotTask {
    fn params(&self, llm: &LlmConfigView) -> BotParams {
        BotParams {
            session_id: self.session_code.clone(),
            participant_id: self.participant_code.clone(),
            player_id: self.player_id,
            url: self.url.clone(),
            model: self.model.name.clone(),
            provider: self.model.provider.key().to_string(),
            role: self.role.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            throttle: llm.throttle,
        }
    }
}

/// Sampling settings recorded with a conversation
#[derive(Debug, Clone, Copy)]
struct LlmConfigView {
    temperature: f32,
    max_tokens: u32,
    throttle: bool,
}

/// How a bot finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotOutcome {
    pub participant_code: String,
    pub pages: usize,
}

/// Starts bots for a session's LLM slots
#[async_trait]
pub trait BotRunner: Send + Sync {
    async fn run(&self, task: BotTask) -> Result<BotOutcome>;
}

/// Runs each task with a fresh [`LlmClient`] for the slot's model
#[derive(Debug, Clone)]
pub struct LlmBotRunner {
    lab: LabConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl LlmBotRunner {
    pub fn new(lab: LabConfig, rate_limiter: Option<Arc<RateLimiter>>) -> Self {
        Self { lab, rate_limiter }
    }
}

#[async_trait]
impl BotRunner for LlmBotRunner {
    async fn run(&self, task: BotTask) -> Result<BotOutcome> {
        let config = LlmConfig::for_model(&task.model, &self.lab, |k| std::env::var(k).ok())?;
        let view = LlmConfigView {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            throttle: self.lab.bots.throttle,
        };
        let mut client = LlmClient::new(config)?;
        if let Some(limiter) = &self.rate_limiter {
            client = client.with_rate_limiter(limiter.clone());
        }

        let params = task.params(&view);
        LlmBot::new(client, task, params, self.lab.bots.clone())?
            .run()
            .await
    }
}

/// Drives one participant through the experiment
pub struct LlmBot<M> {
    model: M,
    browser: ParticipantBrowser,
    task: BotTask,
    params: BotParams,
    settings: BotSettings,
    /// Full log of the bot's exchanges, persisted after every turn
    conversation: Vec<ChatMessage>,
    summary: String,
}

impl<M: ChatModel> LlmBot<M> {
    pub fn new(model: M, task: BotTask, params: BotParams, settings: BotSettings) -> Result<Self> {
        let conversation = vec![ChatMessage::system(task.prompts.system.clone())];
        Ok(Self {
            model,
            browser: ParticipantBrowser::new()?,
            task,
            params,
            settings,
            conversation,
            summary: String::new(),
        })
    }

    pub async fn run(mut self) -> Result<BotOutcome> {
        let participant = self.task.participant_code.clone();
        tracing::info!(
            "Bot for player {} ({}) starting with {}",
            self.task.player_id,
            participant,
            self.model.model_name()
        );
        self.task.store.mark_started(&participant)?;
        self.persist()?;

        let result = self.drive().await;

        if let Err(e) = self.persist() {
            tracing::warn!("Could not save conversation for {}: {}", participant, e);
        }
        match &result {
            Ok(outcome) => {
                self.task.store.mark_finished(&participant)?;
                tracing::info!(
                    "Bot for player {} ({}) finished after {} pages",
                    self.task.player_id,
                    participant,
                    outcome.pages
                );
            }
            Err(e) => tracing::error!("Bot for player {} ({}) failed: {}", self.task.player_id, participant, e),
        }
        result
    }

    async fn drive(&mut self) -> Result<BotOutcome> {
        let poll = Duration::from_millis(self.settings.wait_poll_ms.max(1));
        let max_wait = Duration::from_secs(self.settings.max_wait_secs);

        let mut page = self.browser.fetch(&self.task.url).await?;
        let mut pages = 0;
        let mut waiting_since: Option<Instant> = None;

        loop {
            match page.kind {
                PageKind::Finished => break,
                PageKind::Wait => {
                    let since = *waiting_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= max_wait {
                        return Err(LabError::Timeout { duration: max_wait });
                    }
                    tracing::debug!("{} waiting at {}", self.task.participant_code, page.url);
                    sleep(poll).await;
                    page = self.browser.fetch(&page.url).await?;
                }
                PageKind::Form => {
                    waiting_since = None;
                    pages += 1;
                    if pages > self.settings.max_pages {
                        return Err(self.failure(format!(
                            "gave up after {} pages without reaching the end",
                            self.settings.max_pages
                        )));
                    }
                    let fields = self.answer_page(&page).await?;
                    self.persist()?;
                    page = self.browser.submit(&page, &fields).await?;
                }
            }
        }

        Ok(BotOutcome {
            participant_code: self.task.participant_code.clone(),
            pages,
        })
    }

    /// Ask the model about a page and return the form fields to submit
    async fn answer_page(&mut self, page: &PageSnapshot) -> Result<Vec<(String, String)>> {
        if !page.has_questions() {
            let prompt = format!(
                "{}{}",
                self.task.prompts.render_no_questions(&page.body, &self.summary),
                answer::SUMMARY_FORMAT
            );
            let reply = self.ask(vec![ChatMessage::user(prompt)]).await?;
            match BotReply::parse(&reply) {
                Ok(parsed) if !parsed.summary.is_empty() => self.summary = parsed.summary,
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    "{}: ignoring unreadable summary on {}: {}",
                    self.task.participant_code,
                    page.url,
                    e
                ),
            }
            return Ok(Vec::new());
        }

        let mut prompt = self
            .task
            .prompts
            .render_questions(&page.body, &page.questions_json(), &self.summary);
        if !page.errors.is_empty() {
            prompt = format!(
                "Your previous submission of this page was rejected: {}\n\n{}",
                page.errors.join(" "),
                prompt
            );
        }
        prompt.push_str(answer::ANSWER_FORMAT);

        let mut turns = vec![ChatMessage::user(prompt)];
        let mut last_problem = String::new();
        for attempt in 1..=MAX_ANSWER_ATTEMPTS {
            let reply = self.ask(turns.clone()).await?;
            let problem = match BotReply::parse(&reply) {
                Ok(parsed) => match parsed.form_fields(page) {
                    Ok(fields) => {
                        if !parsed.summary.is_empty() {
                            self.summary = parsed.summary;
                        }
                        return Ok(fields);
                    }
                    Err(problem) => problem,
                },
                Err(problem) => problem,
            };

            tracing::warn!(
                "{}: unusable answer on {} (attempt {}/{}): {}",
                self.task.participant_code,
                page.url,
                attempt,
                MAX_ANSWER_ATTEMPTS,
                problem
            );
            turns.push(ChatMessage::assistant(reply));
            turns.push(ChatMessage::user(format!(
                "{} {}. Please answer again.{}",
                answer::RETRY_PREFIX,
                problem,
                answer::ANSWER_FORMAT
            )));
            last_problem = problem;
        }

        Err(self.failure(format!(
            "no usable answer for {} after {} attempts: {}",
            page.url, MAX_ANSWER_ATTEMPTS, last_problem
        )))
    }

    /// One model call; the new prompt and the reply are appended to the log
    async fn ask(&mut self, turns: Vec<ChatMessage>) -> Result<String> {
        if let Some(prompt) = turns.last() {
            self.conversation.push(prompt.clone());
        }
        let mut messages = vec![ChatMessage::system(self.task.prompts.system.clone())];
        messages.extend(turns);

        let response = self.model.chat(&ChatRequest::new(messages)).await?;
        self.conversation.push(ChatMessage::assistant(response.content.clone()));
        self.persist()?;
        Ok(response.content)
    }

    fn persist(&self) -> Result<()> {
        self.task
            .store
            .save_conversation(&self.task.participant_code, &self.params, &self.conversation)
    }

    fn failure(&self, reason: String) -> LabError {
        LabError::BotFailed {
            participant: self.task.participant_code.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;
    use crate::llm::ChatResponse;
    use crate::paradigm::PromptBook;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ScriptedModel {
        replies: Mutex<VecDeque<String>>,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl ScriptedModel {
        fn new(replies: &[&str]) -> (Self, Arc<Mutex<Vec<ChatRequest>>>) {
            let requests = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                    requests: requests.clone(),
                },
                requests,
            )
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().push(request.clone());
            let content = self.replies.lock().pop_front().unwrap_or_else(|| "{}".to_string());
            Ok(ChatResponse {
                model: "scripted".into(),
                content,
                finish_reason: None,
                usage: None,
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    async fn mount_experiment(server: &MockServer) {
        let intro = format!(
            r#"<html><body><form method="post" class="otree-form" action="{uri}/p/p1/rps/Intro/1">
               <p>Welcome to Rock Paper Scissors.</p><button>Next</button></form></body></html>"#,
            uri = server.uri()
        );
        let decision = format!(
            r#"<html><body><form method="post" class="otree-form" action="{uri}/p/p1/rps/Decision/2">
               <p>Round 1 of 1</p>
               <input type="radio" name="choice" value="R" id="id_choice-0"><label for="id_choice-0">Rock</label>
               <input type="radio" name="choice" value="P" id="id_choice-1"><label for="id_choice-1">Paper</label>
               </form></body></html>"#,
            uri = server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/InitializeParticipant/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(intro))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/p/p1/rps/Intro/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(decision))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/p/p1/rps/Decision/2"))
            .and(body_string_contains("choice=R"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "/OutOfRangeNotification/p1"),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/OutOfRangeNotification/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>No more pages</body></html>"))
            .mount(server)
            .await;
    }

    fn task(server: &MockServer, store: ConversationStore) -> (BotTask, BotParams) {
        let model = ModelSpec::new(Provider::Openai, "gpt-4o-mini");
        let task = BotTask {
            session_code: "s1".into(),
            participant_code: "p1".into(),
            player_id: 1,
            url: format!("{}/InitializeParticipant/p1", server.uri()),
            model,
            role: None,
            prompts: PromptBook::builtin().for_role(None),
            store,
        };
        let params = task.params(&LlmConfigView {
            temperature: 0.7,
            max_tokens: 1024,
            throttle: true,
        });
        (task, params)
    }

    fn settings() -> BotSettings {
        BotSettings {
            wait_poll_ms: 10,
            max_wait_secs: 1,
            ..BotSettings::default()
        }
    }

    #[tokio::test]
    async fn test_bot_plays_to_the_end_and_retries_bad_answers() {
        let server = MockServer::start().await;
        mount_experiment(&server).await;

        let (model, requests) = ScriptedModel::new(&[
            r#"{"summary": "Intro read"}"#,
            r#"{"answers": {"choice": {"answer": "Lizard", "reason": "?"}}}"#,
            r#"```json
{"answers": {"choice": {"answer": "rock", "reason": "solid"}}, "summary": "Played rock"}
```"#,
        ]);
        let store = ConversationStore::open_in_memory().unwrap();
        let (task, params) = task(&server, store.clone());

        let outcome = LlmBot::new(model, task, params, settings())
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(
            outcome,
            BotOutcome {
                participant_code: "p1".into(),
                pages: 2
            }
        );

        let requests = requests.lock();
        assert_eq!(requests.len(), 3);
        // The decision prompt carries the summary from the intro page
        assert!(requests[1].messages[1].content.contains("Intro read"));
        // The retry includes the rejected reply and the reason
        let retry = &requests[2].messages;
        assert_eq!(retry.len(), 4);
        assert!(retry[3].content.contains("'Lizard' for question 'choice'"));

        let record = store.conversation("p1").unwrap().unwrap();
        assert_eq!(record.params.session_id, "s1");
        assert_eq!(record.messages.len(), 7);
        assert!(record.messages[3].content.contains("Round 1 of 1"));
    }

    #[tokio::test]
    async fn test_bot_fails_after_repeated_bad_answers() {
        let server = MockServer::start().await;
        mount_experiment(&server).await;

        let bad = r#"{"answers": {"choice": {"answer": "Lizard"}}}"#;
        let (model, requests) = ScriptedModel::new(&[r#"{"summary": ""}"#, bad, bad, bad]);
        let store = ConversationStore::open_in_memory().unwrap();
        let (task, params) = task(&server, store.clone());

        let err = LlmBot::new(model, task, params, settings())
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::BotFailed { ref participant, .. } if participant == "p1"));
        assert_eq!(requests.lock().len(), 1 + MAX_ANSWER_ATTEMPTS);
        assert!(store.conversation("p1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bot_times_out_on_endless_wait_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/InitializeParticipant/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><div class="otree-wait-page__body">Please wait</div></body></html>"#,
            ))
            .mount(&server)
            .await;

        let (model, requests) = ScriptedModel::new(&[]);
        let store = ConversationStore::open_in_memory().unwrap();
        let (task, params) = task(&server, store);

        let err = LlmBot::new(model, task, params, settings())
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Timeout { .. }));
        assert!(requests.lock().is_empty());
    }
}
