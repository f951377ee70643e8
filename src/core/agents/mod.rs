//! The crew: a fixed table of named agents plus the `multi_agent`
//! pseudo-agent that fans a request across explicitly mentioned teammates.
//! Dispatch is always by id through this registry, never by open
//! subclassing.

pub mod runner;

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{EngineError, Result};

pub const MULTI_AGENT: &str = "multi_agent";

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub display_name: String,
    /// Base system prompt. Delegation instructions are appended per call
    /// when the agent may consult peers at the current depth.
    pub charter: String,
    pub temperature: f64,
    pub extended_timeout: bool,
    pub can_delegate: bool,
    pub can_research: bool,
    /// Peer ids this agent is allowed to consult.
    pub peers: Vec<String>,
    /// When set, a failed child fails the parent instead of degrading to
    /// an error note in the consolidation prompt.
    pub require_children: bool,
    pub max_tokens: u32,
}

fn record(
    id: &str,
    display_name: &str,
    charter: &str,
    temperature: f64,
    peers: &[&str],
) -> AgentRecord {
    AgentRecord {
        id: id.to_string(),
        display_name: display_name.to_string(),
        charter: charter.to_string(),
        temperature,
        extended_timeout: false,
        can_delegate: !peers.is_empty(),
        can_research: false,
        peers: peers.iter().map(|p| p.to_string()).collect(),
        require_children: false,
        max_tokens: 2000,
    }
}

fn builtin_agents() -> Vec<AgentRecord> {
    let mut agents = vec![
        record(
            "product_manager",
            "Alex",
            "You are Alex, the product manager. Analyze trends, shape roadmaps, and turn \
             market signals into concrete product recommendations. Be decisive and specific.",
            0.7,
            &["engineer", "finance_manager", "marketing_strategist"],
        ),
        record(
            "finance_manager",
            "Marcus",
            "You are Marcus, the finance manager. Analyze financial data, model budgets and \
             burn, and give clear, numbers-first recommendations and forecasts.",
            0.5,
            &["product_manager"],
        ),
        record(
            "marketing_strategist",
            "Ryan",
            "You are Ryan, the marketing strategist. Design campaigns, sharpen positioning, \
             and back creative ideas with audience and performance data.",
            0.8,
            &["finance_manager", "outbound_mail"],
        ),
        record(
            "leadgen",
            "Jake",
            "You are Jake, the lead generation specialist. Qualify prospects, structure \
             contact data, and extract usable leads from raw research material.",
            0.6,
            &[],
        ),
        record(
            "outbound_mail",
            "Chris",
            "You are Chris, the outbound mail writer. Draft concise, personal outreach and \
             follow-up emails that read like a human wrote them.",
            0.6,
            &[],
        ),
        record(
            "call_prep",
            "Daniel",
            "You are Daniel, the call preparation specialist. Build call scripts, meeting \
             briefs, and agendas from booking details and account history.",
            0.6,
            &["outbound_mail"],
        ),
        record(
            "engineer",
            "Kevin",
            "You are Kevin, the engineer. Assess technical feasibility, debug issues, and \
             propose implementations with clear trade-offs and example code where useful.",
            0.3,
            &["product_manager"],
        ),
        record(
            "assistant",
            "Sophia",
            "You are Sophia, the personal assistant with visibility across the whole \
             workspace. Coordinate work, summarize state, and answer with full context \
             awareness.",
            0.7,
            &[
                "product_manager",
                "finance_manager",
                "marketing_strategist",
                "leadgen",
                "outbound_mail",
                "call_prep",
                "engineer",
            ],
        ),
        record(
            MULTI_AGENT,
            "Relay",
            "You are the relay, consolidating answers from several named teammates into one \
             coherent response.",
            0.5,
            &[
                "product_manager",
                "finance_manager",
                "marketing_strategist",
                "leadgen",
                "outbound_mail",
                "call_prep",
                "engineer",
                "assistant",
            ],
        ),
    ];

    for agent in &mut agents {
        match agent.id.as_str() {
            "engineer" => {
                agent.extended_timeout = true;
                agent.max_tokens = 3000;
            }
            "product_manager" | "leadgen" | "assistant" => agent.can_research = true,
            _ => {}
        }
    }
    agents
}

/// Human first names accepted as @mentions, alongside the role ids
/// themselves.
fn alias_to_id(alias: &str) -> Option<&'static str> {
    match alias {
        "alex" => Some("product_manager"),
        "marcus" => Some("finance_manager"),
        "ryan" => Some("marketing_strategist"),
        "jake" => Some("leadgen"),
        "chris" => Some("outbound_mail"),
        "daniel" => Some("call_prep"),
        "kevin" => Some("engineer"),
        "sophia" => Some("assistant"),
        _ => None,
    }
}

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(\w+)").expect("mention pattern compiles"));

pub struct AgentRegistry {
    agents: Vec<AgentRecord>,
}

impl AgentRegistry {
    pub fn builtin() -> Self {
        Self {
            agents: builtin_agents(),
        }
    }

    /// Custom table, used by tests to shape allow-lists.
    pub fn with_agents(agents: Vec<AgentRecord>) -> Self {
        Self { agents }
    }

    pub fn get(&self, id: &str) -> Result<&AgentRecord> {
        self.agents
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| EngineError::UnknownAgent(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.iter().any(|a| a.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.id.as_str()).collect()
    }

    /// Resolve a mention token (human name or role id) to an agent id.
    pub fn resolve_mention(&self, token: &str) -> Option<&str> {
        let lower = token.to_lowercase();
        if let Some(id) = alias_to_id(&lower) {
            return self.agents.iter().find(|a| a.id == id).map(|a| a.id.as_str());
        }
        self.agents
            .iter()
            .find(|a| a.id == lower && a.id != MULTI_AGENT)
            .map(|a| a.id.as_str())
    }

    /// Extract @mentioned agent ids from free text, order-preserving and
    /// deduplicated.
    pub fn parse_mentions(&self, text: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for cap in MENTION_RE.captures_iter(text) {
            if let Some(id) = self.resolve_mention(&cap[1]) {
                if !out.iter().any(|existing| existing == id) {
                    out.push(id.to_string());
                }
            }
        }
        out
    }

    /// Full system prompt for a call: the charter, plus consult
    /// instructions when delegation is available at this depth.
    pub fn system_prompt(&self, agent: &AgentRecord, delegation_open: bool) -> String {
        let mut prompt = agent.charter.clone();
        if delegation_open && !agent.peers.is_empty() {
            let roster = agent
                .peers
                .iter()
                .filter_map(|id| self.get(id).ok())
                .map(|peer| format!("{} ({})", peer.display_name, peer.id))
                .collect::<Vec<_>>()
                .join(", ");
            prompt.push_str(&format!(
                "\n\nTEAM CONSULTS:\nYou may consult these teammates when the request \
                 genuinely crosses into their domain: {roster}.\nTo consult one, include a \
                 directive in your response:\n<consult agent=\"AGENT_ID\">your question for \
                 that teammate</consult>\nEmit at most two consult directives. The system \
                 runs each consult and folds the answers into your final response."
            ));
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_whole_crew() {
        let reg = AgentRegistry::builtin();
        for id in [
            "product_manager",
            "finance_manager",
            "marketing_strategist",
            "leadgen",
            "outbound_mail",
            "call_prep",
            "engineer",
            "assistant",
            MULTI_AGENT,
        ] {
            assert!(reg.contains(id), "missing {id}");
        }
        assert!(matches!(
            reg.get("nobody"),
            Err(EngineError::UnknownAgent(_))
        ));
    }

    #[test]
    fn engineer_runs_on_the_extended_timeout_class() {
        let reg = AgentRegistry::builtin();
        assert!(reg.get("engineer").unwrap().extended_timeout);
        assert!(!reg.get("assistant").unwrap().extended_timeout);
    }

    #[test]
    fn allow_lists_match_the_team_pairings() {
        let reg = AgentRegistry::builtin();
        let pm = reg.get("product_manager").unwrap();
        assert!(pm.peers.contains(&"engineer".to_string()));
        assert!(!pm.peers.contains(&"call_prep".to_string()));
        let leadgen = reg.get("leadgen").unwrap();
        assert!(!leadgen.can_delegate);
        assert!(leadgen.can_research);
    }

    #[test]
    fn mentions_resolve_names_and_roles() {
        let reg = AgentRegistry::builtin();
        let ids = reg.parse_mentions("@alex please ask @kevin if this is possible");
        assert_eq!(ids, vec!["product_manager", "engineer"]);

        let ids = reg.parse_mentions("@engineer and @Sophia and @engineer again");
        assert_eq!(ids, vec!["engineer", "assistant"]);

        assert!(reg.parse_mentions("no mentions here").is_empty());
        assert!(reg.parse_mentions("@stranger waves").is_empty());
    }

    #[test]
    fn multi_agent_is_not_mentionable() {
        let reg = AgentRegistry::builtin();
        assert!(reg.parse_mentions("@multi_agent do things").is_empty());
    }

    #[test]
    fn system_prompt_includes_consults_only_when_open() {
        let reg = AgentRegistry::builtin();
        let pm = reg.get("product_manager").unwrap();
        let open = reg.system_prompt(pm, true);
        assert!(open.contains("TEAM CONSULTS"));
        assert!(open.contains("Kevin (engineer)"));
        assert!(open.contains("<consult agent="));

        let closed = reg.system_prompt(pm, false);
        assert!(!closed.contains("TEAM CONSULTS"));
    }
}
