//! Minimal robots.txt interpreter.
//!
//! Understands `User-agent`, `Allow`, `Disallow` and `Crawl-delay`, with
//! `*` and `$` wildcards. The most specific (longest) matching rule wins;
//! on a tie `Allow` wins.

use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RobotsTxt {
    groups: HashMap<String, Group>,
}

#[derive(Debug, Clone, Default)]
struct Group {
    rules: Vec<Rule>,
    crawl_delay: Option<f64>,
}

#[derive(Debug, Clone)]
struct Rule {
    is_allow: bool,
    path: String,
    regex: Option<Regex>,
}

impl RobotsTxt {
    pub fn parse(content: &str) -> Self {
        let mut groups: HashMap<String, Group> = HashMap::new();
        let mut current_agents: Vec<String> = Vec::new();
        let mut in_rules = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    // Consecutive User-agent lines share one group.
                    if in_rules {
                        current_agents.clear();
                        in_rules = false;
                    }
                    let agent = value.to_lowercase();
                    groups.entry(agent.clone()).or_default();
                    current_agents.push(agent);
                }
                "allow" | "disallow" => {
                    in_rules = true;
                    // An empty Disallow allows everything.
                    if value.is_empty() {
                        continue;
                    }
                    let rule = Rule {
                        is_allow: key == "allow",
                        path: value.to_string(),
                        regex: create_regex(value),
                    };
                    for agent in &current_agents {
                        if let Some(group) = groups.get_mut(agent) {
                            group.rules.push(rule.clone());
                        }
                    }
                }
                "crawl-delay" => {
                    in_rules = true;
                    if let Ok(delay) = value.parse::<f64>() {
                        if delay >= 0.0 {
                            for agent in &current_agents {
                                if let Some(group) = groups.get_mut(agent) {
                                    group.crawl_delay = Some(delay);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Self { groups }
    }

    fn group_for(&self, user_agent: &str) -> Option<&Group> {
        let ua = user_agent.to_lowercase();
        let product = ua.split('/').next().unwrap_or(&ua).to_string();
        self.groups
            .iter()
            .filter(|(agent, _)| agent.as_str() != "*" && product.contains(agent.as_str()))
            .max_by_key(|(agent, _)| agent.len())
            .map(|(_, group)| group)
            .or_else(|| self.groups.get("*"))
    }

    pub fn is_path_allowed(&self, path: &str, user_agent: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };

        let mut best: Option<(usize, bool)> = None;
        for rule in &group.rules {
            let matched = match rule.regex {
                Some(ref regex) => regex.is_match(path),
                None => path.starts_with(&rule.path),
            };
            if !matched {
                continue;
            }
            let len = rule.path.len();
            best = match best {
                Some((best_len, best_allow)) if best_len > len => Some((best_len, best_allow)),
                Some((best_len, best_allow)) if best_len == len => {
                    Some((best_len, best_allow || rule.is_allow))
                }
                _ => Some((len, rule.is_allow)),
            };
        }

        best.map(|(_, allow)| allow).unwrap_or(true)
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        self.group_for(user_agent).and_then(|g| g.crawl_delay)
    }
}

fn create_regex(pattern: &str) -> Option<Regex> {
    if !pattern.contains('*') && !pattern.ends_with('$') {
        return None;
    }

    let mut regex_pattern = regex::escape(pattern);
    regex_pattern = regex_pattern.replace("\\*", ".*");
    if regex_pattern.ends_with("\\$") {
        regex_pattern.truncate(regex_pattern.len() - 2);
        regex_pattern.push('$');
    }

    Regex::new(&format!("^{}", regex_pattern)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UA: &str = "crawl-harness/0.1.0";

    #[test]
    fn test_disallow_and_allow() {
        let robots = RobotsTxt::parse(
            r#"
User-agent: *
Disallow: /private/
Allow: /private/public/
Disallow: /admin
"#,
        );

        assert!(!robots.is_path_allowed("/private/secret", UA));
        assert!(robots.is_path_allowed("/private/public/page", UA));
        assert!(!robots.is_path_allowed("/admin/dashboard", UA));
        assert!(robots.is_path_allowed("/docs", UA));
    }

    #[test]
    fn test_specific_agent_group_wins() {
        let robots = RobotsTxt::parse(
            r#"
User-agent: *
Disallow: /

User-agent: crawl-harness
Disallow: /secret/
Crawl-delay: 2.5
"#,
        );

        assert!(robots.is_path_allowed("/docs", UA));
        assert!(!robots.is_path_allowed("/secret/x", UA));
        assert!(!robots.is_path_allowed("/docs", "OtherBot/1.0"));
        assert_eq!(robots.crawl_delay(UA), Some(2.5));
    }

    #[test]
    fn test_wildcards() {
        let robots = RobotsTxt::parse(
            r#"
User-agent: *
Disallow: /*.pdf$
Disallow: /tmp*
"#,
        );

        assert!(!robots.is_path_allowed("/files/report.pdf", UA));
        assert!(robots.is_path_allowed("/files/report.pdf.html", UA));
        assert!(!robots.is_path_allowed("/tmp123", UA));
    }

    #[test]
    fn test_empty_disallow_allows_everything() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow:\n");
        assert!(robots.is_path_allowed("/anything", UA));
        assert!(RobotsTxt::parse("").is_path_allowed("/anything", UA));
    }
}
