//! The LLM oracle bridge: grammar induction at startup, seed enrichment,
//! and stall-recovery probes during fuzzing.
//!
//! Every interaction funnels through [`ChatClient::chat`], which returns
//! `None` on any failure; fuzzing never blocks on the oracle.

use std::{collections::HashMap, time::Duration};

use serde_json::json;

use crate::grammar::MessageTemplate;

/// How often the template question is repeated; only answers that agree
/// across the majority of rounds are kept.
pub const TEMPLATE_CONSISTENCY_COUNT: u32 = 5;
/// Retries per chat call before giving up on it.
pub const CHAT_RETRIES: u32 = 3;
/// Total chat-call budget for stall recovery within one session.
pub const STALL_CHAT_BUDGET: u32 = 100;

pub struct ChatClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    enabled: bool,
    /// Total completed chat calls, for the plot file.
    pub chat_count: u32,
    stall_budget: u32,
}

impl ChatClient {
    /// Configure from the environment. With neither an endpoint nor an API
    /// key present the client stays disabled and all calls return `None`.
    pub fn from_env() -> Self {
        let endpoint = std::env::var("LLM_ENDPOINT").ok();
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        let model =
            std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let enabled = endpoint.is_some() || api_key.is_some();
        let endpoint = endpoint
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
        if enabled {
            log::info!("Oracle enabled: endpoint {endpoint}, model {model}");
        } else {
            log::info!("No oracle configured; grammar and stall recovery are off");
        }
        Self {
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("HTTP client construction cannot fail with static options"),
            endpoint,
            model,
            api_key,
            enabled,
            chat_count: 0,
            stall_budget: STALL_CHAT_BUDGET,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stall_budget_left(&self) -> u32 {
        self.stall_budget
    }

    /// One chat completion. Retries transport-level failures; any
    /// remaining failure yields `None`.
    pub fn chat(&mut self, prompt: &str, retries: u32, temperature: f64) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content":
                    "You are assisting a network-protocol testing tool. \
                     Answer with exactly what is asked for, no commentary."},
                {"role": "user", "content": prompt}
            ],
            "temperature": temperature,
        });
        for attempt in 0..retries.max(1) {
            let mut req = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            let resp = match req.send() {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("Oracle request failed (attempt {attempt}): {e}");
                    continue;
                }
            };
            if !resp.status().is_success() {
                log::debug!("Oracle answered HTTP {}", resp.status());
                continue;
            }
            let value: serde_json::Value = match resp.json() {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("Oracle answer was not JSON: {e}");
                    continue;
                }
            };
            if let Some(text) = value["choices"][0]["message"]["content"].as_str() {
                self.chat_count += 1;
                return Some(text.to_string());
            }
            log::debug!("Oracle answer had no content field");
        }
        None
    }

    /// Ask for message templates repeatedly and keep what the answers
    /// agree on.
    pub fn induce_grammar(&mut self, protocol: &str) -> Vec<MessageTemplate> {
        if !self.enabled {
            return Vec::new();
        }
        let prompt = format!(
            "For the {protocol} protocol, list the client request templates as a JSON \
             object. Keys are the literal message headers (including any trailing \
             space), values are arrays of literal field keywords or separators that \
             may appear in the rest of the message. Example: \
             {{\"USER \": [], \"PORT \": [\",\"]}}. Answer with JSON only."
        );
        let mut rounds = Vec::new();
        for _ in 0..TEMPLATE_CONSISTENCY_COUNT {
            if let Some(answer) = self.chat(&prompt, CHAT_RETRIES, 0.5) {
                if let Some(templates) = parse_template_answer(&answer) {
                    rounds.push(templates);
                }
            }
        }
        let agreed = vote_templates(&rounds);
        log::info!(
            "Grammar induction: {} rounds answered, {} templates agreed",
            rounds.len(),
            agreed.len()
        );
        agreed
    }

    /// Ask for a variant of `seed` that also exercises `missing_header`.
    /// Returns `None` when the oracle fails or parrots the input back.
    pub fn enrich_seed(&mut self, seed: &[u8], missing_header: &str) -> Option<Vec<u8>> {
        let seed_text = String::from_utf8_lossy(seed);
        let prompt = format!(
            "Below is a client session for a network protocol, one message per line. \
             Produce a similar session that additionally uses a {missing_header:?} \
             message in a sensible position. Keep the line format, answer with the \
             raw session only.\n\n{seed_text}"
        );
        let answer = self.chat(&prompt, CHAT_RETRIES, 1.0)?;
        let enriched = normalize_lines(&answer);
        if enriched.is_empty() || enriched == seed {
            return None;
        }
        Some(enriched)
    }

    /// Stall recovery: given the dialogue so far, propose the next request.
    /// Draws down the per-session budget.
    pub fn propose_next_request(&mut self, dialog: &[(Vec<u8>, Vec<u8>)]) -> Option<Vec<u8>> {
        if self.stall_budget == 0 {
            return None;
        }
        self.stall_budget -= 1;
        let mut transcript = String::new();
        for (req, resp) in dialog {
            transcript.push_str("C: ");
            transcript.push_str(String::from_utf8_lossy(req).trim_end());
            transcript.push('\n');
            transcript.push_str("S: ");
            transcript.push_str(String::from_utf8_lossy(resp).trim_end());
            transcript.push('\n');
        }
        let prompt = format!(
            "This is a client/server dialogue of a network protocol. Propose the \
             single most plausible next client request that moves the session into a \
             state not seen yet. Answer with the raw request line only.\n\n{transcript}"
        );
        let answer = self.chat(&prompt, 1, 1.0)?;
        let line = answer.lines().find(|l| !l.trim().is_empty())?;
        let mut bytes = line.trim_end().as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        Some(bytes)
    }
}

/// Parse a JSON template answer, tolerating fenced code blocks.
pub fn parse_template_answer(answer: &str) -> Option<Vec<MessageTemplate>> {
    let trimmed = answer.trim();
    let body = if let Some(start) = trimmed.find('{') {
        let end = trimmed.rfind('}')?;
        &trimmed[start..=end]
    } else {
        trimmed
    };
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let obj = value.as_object()?;
    let mut templates = Vec::new();
    for (header, fields) in obj {
        if header.is_empty() {
            continue;
        }
        let fields = fields
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|f| f.as_str())
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        templates.push(MessageTemplate {
            header: header.clone(),
            fields,
        });
    }
    Some(templates)
}

/// Majority vote across induction rounds: a header survives when more than
/// half of the answered rounds mention it, and a field when more than half
/// of the rounds mentioning its header agree on it.
pub fn vote_templates(rounds: &[Vec<MessageTemplate>]) -> Vec<MessageTemplate> {
    if rounds.is_empty() {
        return Vec::new();
    }
    let mut header_votes: HashMap<&str, u32> = HashMap::new();
    let mut field_votes: HashMap<(&str, &str), u32> = HashMap::new();
    for round in rounds {
        for t in round {
            *header_votes.entry(&t.header).or_insert(0) += 1;
            for f in &t.fields {
                *field_votes.entry((&t.header, f)).or_insert(0) += 1;
            }
        }
    }
    let quorum = rounds.len() as u32 / 2;
    let mut headers: Vec<&str> = header_votes
        .iter()
        .filter(|(_, &v)| v > quorum)
        .map(|(&h, _)| h)
        .collect();
    headers.sort_unstable();
    headers
        .into_iter()
        .map(|h| {
            let votes = header_votes[h];
            let mut fields: Vec<String> = field_votes
                .iter()
                .filter(|((fh, _), &v)| *fh == h && v * 2 > votes)
                .map(|((_, f), _)| (*f).to_string())
                .collect();
            fields.sort_unstable();
            MessageTemplate {
                header: h.to_string(),
                fields,
            }
        })
        .collect()
}

/// Normalize an oracle-produced session to CRLF line endings, dropping
/// markdown fences it likes to add.
fn normalize_lines(answer: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for line in answer.lines() {
        let line = line.trim_end();
        if line.starts_with("```") || line.is_empty() {
            continue;
        }
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_template_json() {
        let answer = "Sure:\n```json\n{\"USER \": [], \"PORT \": [\",\"]}\n```";
        let templates = parse_template_answer(answer).unwrap();
        assert_eq!(templates.len(), 2);
        assert!(templates.iter().any(|t| t.header == "PORT " && t.fields == vec![","]));
        assert!(parse_template_answer("not json at all").is_none());
    }

    #[test]
    fn voting_keeps_the_majority_answer() {
        let mk = |header: &str, fields: &[&str]| MessageTemplate {
            header: header.into(),
            fields: fields.iter().map(|s| s.to_string()).collect(),
        };
        let rounds = vec![
            vec![mk("USER ", &[]), mk("PORT ", &[","])],
            vec![mk("USER ", &[]), mk("PORT ", &[","])],
            vec![mk("USER ", &[]), mk("QUIT", &[])],
            vec![mk("USER ", &[]), mk("PORT ", &[])],
            vec![mk("HALLUCINATED ", &[])],
        ];
        let agreed = vote_templates(&rounds);
        let headers: Vec<_> = agreed.iter().map(|t| t.header.as_str()).collect();
        assert!(headers.contains(&"USER "));
        assert!(headers.contains(&"PORT "));
        assert!(!headers.contains(&"QUIT"));
        assert!(!headers.contains(&"HALLUCINATED "));
        // Two of the three PORT rounds agreed on the comma.
        let port = agreed.iter().find(|t| t.header == "PORT ").unwrap();
        assert_eq!(port.fields, vec![","]);
    }

    #[test]
    fn normalizes_oracle_sessions() {
        let out = normalize_lines("```\nUSER a\nPASS b\n```\n");
        assert_eq!(out, b"USER a\r\nPASS b\r\n");
    }

    /// Minimal HTTP stub speaking just enough of the completions API for
    /// one request.
    fn stub_completions_server(content: &'static str) -> (std::thread::JoinHandle<()>, String) {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 8192];
            let _ = stream.read(&mut buf);
            let body = format!(
                "{{\"choices\":[{{\"message\":{{\"content\":{}}}}}]}}",
                serde_json::to_string(content).unwrap()
            );
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(resp.as_bytes()).unwrap();
        });
        (handle, format!("http://{addr}/v1/chat/completions"))
    }

    fn client_for(endpoint: String) -> ChatClient {
        ChatClient {
            client: reqwest::blocking::Client::new(),
            endpoint,
            model: "stub".into(),
            api_key: None,
            enabled: true,
            chat_count: 0,
            stall_budget: STALL_CHAT_BUDGET,
        }
    }

    #[test]
    fn chat_round_trips_through_a_stub_server() {
        let (server, endpoint) = stub_completions_server("RETR file\n");
        let mut client = client_for(endpoint);
        let answer = client.chat("next request?", 1, 1.0);
        server.join().unwrap();
        assert_eq!(answer.as_deref(), Some("RETR file\n"));
        assert_eq!(client.chat_count, 1);
    }

    #[test]
    fn stall_proposal_is_crlf_terminated_and_budgeted() {
        let (server, endpoint) = stub_completions_server("STOR upload.txt");
        let mut client = client_for(endpoint);
        let dialog = vec![(b"USER x\r\n".to_vec(), b"331".to_vec())];
        let proposal = client.propose_next_request(&dialog).unwrap();
        server.join().unwrap();
        assert_eq!(proposal, b"STOR upload.txt\r\n");
        assert_eq!(client.stall_budget_left(), STALL_CHAT_BUDGET - 1);
    }
}
