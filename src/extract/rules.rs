//! Rule-based extraction: regex and sender-domain heuristics, no network.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{ExtractedFields, Extraction, Extractor};
use crate::error::CapabilityError;
use crate::source::RawMessage;

/// Free-mail providers never name the employer.
const FREE_MAIL: &[&str] = &[
    "gmail", "googlemail", "yahoo", "outlook", "hotmail", "icloud", "me", "aol", "proton",
    "protonmail", "live",
];

/// Sender or link domain to the platform the application went through.
const SOURCE_MAP: &[(&str, &str)] = &[
    ("linkedin.com", "LinkedIn"),
    ("indeed.com", "Indeed"),
    ("glassdoor.com", "Glassdoor"),
    ("workatastartup.com", "Y Combinator"),
    ("angel.co", "AngelList"),
    ("wellfound.com", "Wellfound"),
    ("greenhouse.io", "Greenhouse"),
    ("greenhouse-mail.io", "Greenhouse"),
    ("lever.co", "Lever"),
    ("ashbyhq.com", "Ashby"),
    ("eightfold.ai", "EightFold"),
    ("myworkdayjobs.com", "Workday"),
    ("myworkday.com", "Workday"),
    ("workday.com", "Workday"),
    ("smartrecruiters.com", "SmartRecruiters"),
    ("icims.com", "iCIMS"),
    ("workable.com", "Workable"),
    ("bamboohr.com", "BambooHR"),
    ("jobvite.com", "Jobvite"),
    ("taleo.net", "Taleo"),
];

/// Links on these hosts are preferred as the status link.
const ATS_LINK_DOMAINS: &[&str] = &[
    "greenhouse.io",
    "lever.co",
    "ashbyhq.com",
    "myworkdayjobs.com",
    "workday.com",
    "smartrecruiters.com",
    "icims.com",
    "linkedin.com",
    "indeed.com",
    "workatastartup.com",
];

/// Words that make a phrase look like a job title.
const TITLE_WORDS: &[&str] = &[
    "engineer",
    "engineering",
    "developer",
    "intern",
    "internship",
    "analyst",
    "manager",
    "designer",
    "scientist",
    "consultant",
    "specialist",
    "coordinator",
    "associate",
    "researcher",
    "architect",
    "swe",
    "sde",
];

/// Display-name words that describe a team rather than the company.
const TEAM_WORDS: &[&str] = &[
    "recruiting",
    "recruitment",
    "careers",
    "talent",
    "acquisition",
    "team",
    "hiring",
    "jobs",
    "hr",
];

/// Status phrases, checked in order. The first hit wins.
const STATUS_HINTS: &[(&str, &[&str])] = &[
    (
        "Rejected",
        &[
            "unfortunately",
            "regret to inform",
            "sorry to inform",
            "not selected",
            "not moving forward",
            "decided to move forward with other",
        ],
    ),
    (
        "Offer",
        &["pleased to offer", "offer letter", "extend an offer", "congratulations"],
    ),
    (
        "Interview Scheduled",
        &["interview", "phone screen", "next step", "schedule a call", "availability"],
    ),
    (
        "Under Review",
        &["under review", "reviewing your application", "in progress"],
    ),
    (
        "Applied",
        &[
            "thank you for applying",
            "thanks for applying",
            "application received",
            "received your application",
            "application submitted",
        ],
    ),
];

struct Patterns {
    company: Vec<Regex>,
    position: Vec<Regex>,
    location: Vec<Regex>,
    job_id: Vec<Regex>,
    url: Vec<Regex>,
    subject_separator: Vec<Regex>,
    position_prefix: Vec<Regex>,
    position_suffix: Vec<Regex>,
}

const COMPANY_PATTERNS: &[&str] = &[
    r"(?:applying|applied|application|interest)\s+(?:to|at|with|in)\s+(?:the\s+)?([A-Z][\w&\-]*(?:[ \t]+[A-Z][\w&\-]*){0,3})",
    r"(?:joining|join)\s+(?:the\s+)?([A-Z][\w&\-]*(?:[ \t]+[A-Z][\w&\-]*){0,3})",
    r"([A-Z][\w&\-]*(?:[ \t]+[A-Z][\w&\-]*){0,3})[ \t]+(?:Recruiting|Talent|Hiring|Careers)[ \t]+Team",
];

const POSITION_PATTERNS: &[&str] = &[
    r"(?i)applied\s+for\s+(?:the\s+)?([^\n\r.!?]{3,80}?)\s+(?:position|role|opening)",
    r"(?i)(?:application|applying)\s+(?:for|to)\s+(?:the\s+)?([^\n\r.!?]{3,80}?)\s+(?:position|role|opening)",
    r"(?i)(?:position|role|job title|title)\s*:\s*([^\n\r.!?]{3,80})",
];

const LOCATION_PATTERNS: &[&str] = &[
    r"(?i)(?:location|based in|office in)\s*:?\s*([A-Za-z][^\n\r.!?;]{2,49})",
    r"\b([A-Z][a-z]+(?:\s[A-Z][a-z]+)*,\s*[A-Z]{2})\b",
    r"\b(New York|San Francisco|Los Angeles|Chicago|Boston|Seattle|Austin|Denver)\b",
];

const JOB_ID_PATTERNS: &[&str] = &[
    r"(?i)(?:job\s*id|job\s*#|req(?:uisition)?\s*(?:id|#)|reference(?:\s*(?:id|#|number))?)\s*[:#]?\s*([A-Za-z0-9_\-]{4,50})",
    r"(?i)jobs?/view/([0-9]{5,15})",
    r"(?i)jobs?/([0-9]{5,15})",
    r"(?i)application\?code=([A-Za-z0-9_\-]{10,50})",
];

const URL_PATTERNS: &[&str] = &[r#"https?://[^\s<>"'()\]]+"#];

const SUBJECT_SEPARATORS: &[&str] = &[r"\s+[-|\u{2013}\u{2014}]\s+|:\s+"];

const POSITION_PREFIXES: &[&str] = &[r"(?i)^.*?\b(?:for|to|as)\s+(?:the\s+|an?\s+)?(?:position\s+of\s+)?"];

const POSITION_SUFFIXES: &[&str] = &[
    r"(?i)\s+(?:position|role|opening|job|application)\b.*$",
    r"(?i)\s+(?:at|with|@)\s+.*$",
    r"(?i)\s*\((?:remote|hybrid|onsite|on-site)\)\s*$",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    company: compile(COMPANY_PATTERNS),
    position: compile(POSITION_PATTERNS),
    location: compile(LOCATION_PATTERNS),
    job_id: compile(JOB_ID_PATTERNS),
    url: compile(URL_PATTERNS),
    subject_separator: compile(SUBJECT_SEPARATORS),
    position_prefix: compile(POSITION_PREFIXES),
    position_suffix: compile(POSITION_SUFFIXES),
});

/// Deterministic heuristic extractor.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleExtractor;

impl RuleExtractor {
    /// Run every heuristic over `message`. Never fails.
    pub fn run(message: &RawMessage) -> Extraction {
        let text = format!("{}\n{}", message.subject, message.body);
        let mut confidence = 0.0_f32;

        let company = if let Some(c) = company_from_sender(&message.sender) {
            confidence += 0.35;
            Some(c)
        } else if let Some(c) = company_from_text(&text) {
            confidence += 0.3;
            Some(c)
        } else if let Some(c) = company_from_display_name(&message.sender) {
            confidence += 0.2;
            Some(c)
        } else {
            None
        };

        let position = if let Some(p) = position_from_subject(&message.subject) {
            confidence += 0.35;
            Some(p)
        } else if let Some(p) = position_from_text(&text) {
            confidence += 0.25;
            Some(p)
        } else {
            None
        };

        // The message date stands in for the application date.
        confidence += 0.1;

        let source = source_platform(&message.sender, &text);
        if source.is_some() {
            confidence += 0.1;
        }
        let status_hint = status_hint(&text);
        if status_hint.is_some() {
            confidence += 0.1;
        }

        Extraction {
            fields: ExtractedFields {
                company,
                position,
                applied_date: Some(message.received_at.date_naive()),
                source: Some(source.unwrap_or_else(|| fallback_source(&text).to_string())),
                location: location(&text),
                job_id: job_id(&text),
                status_link: status_link(&text),
                status_hint: status_hint.map(str::to_string),
            },
            confidence: confidence.min(1.0),
        }
    }
}

#[async_trait]
impl Extractor for RuleExtractor {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn extract(&self, message: &RawMessage) -> Result<Option<Extraction>, CapabilityError> {
        Ok(Some(Self::run(message)))
    }
}

// ── Company ─────────────────────────────────────────────────────────

fn sender_address(sender: &str) -> &str {
    match (sender.find('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => &sender[start + 1..end],
        _ => sender.trim(),
    }
}

fn display_name(sender: &str) -> Option<&str> {
    let idx = sender.find('<')?;
    let name = sender[..idx].trim().trim_matches('"').trim();
    (!name.is_empty()).then_some(name)
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_platform_domain(domain: &str) -> bool {
    SOURCE_MAP
        .iter()
        .any(|(d, _)| domain == *d || domain.ends_with(&format!(".{d}")))
}

/// Employer name from the sender's domain, e.g. `jobs@mail.acme.com` → `Acme`.
pub fn company_from_sender(sender: &str) -> Option<String> {
    let address = sender_address(sender).to_lowercase();
    let (_, domain) = address.rsplit_once('@')?;
    if is_platform_domain(domain) {
        return None;
    }

    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }
    let mut idx = labels.len() - 2;
    // Second-level country domains such as acme.co.uk.
    if idx > 0 && labels[idx].len() <= 3 && labels[labels.len() - 1].len() == 2 {
        idx -= 1;
    }
    let name = labels[idx];
    if name.len() < 2 || FREE_MAIL.contains(&name) {
        return None;
    }
    Some(title_case(&name.replace(['-', '_'], " ")))
}

fn looks_like_title(phrase: &str) -> bool {
    phrase
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .any(|w| TITLE_WORDS.contains(&w.as_str()))
}

fn company_from_text(text: &str) -> Option<String> {
    PATTERNS.company.iter().find_map(|re| {
        re.captures_iter(text).find_map(|caps| {
            let name = caps.get(1)?.as_str().trim_end_matches(['.', ',']).trim();
            (name.len() > 1 && name.len() < 50 && !looks_like_title(name)).then(|| name.to_string())
        })
    })
}

fn company_from_display_name(sender: &str) -> Option<String> {
    let name = display_name(sender)?;
    let lower = name.to_lowercase();
    if ["noreply", "no-reply", "no reply", "system", "auto", "notification"]
        .iter()
        .any(|w| lower.contains(w))
    {
        return None;
    }
    let kept: Vec<&str> = name
        .split_whitespace()
        .filter(|w| !TEAM_WORDS.contains(&w.to_lowercase().as_str()))
        .collect();
    (!kept.is_empty()).then(|| kept.join(" "))
}

// ── Position ────────────────────────────────────────────────────────

fn clean_position(segment: &str) -> Option<String> {
    let mut phrase = segment.trim().to_string();

    for re in &PATTERNS.position_prefix {
        let stripped = re.replace(&phrase, "").to_string();
        if looks_like_title(&stripped) {
            phrase = stripped;
        }
    }
    for re in &PATTERNS.position_suffix {
        let stripped = re.replace(&phrase, "").to_string();
        if looks_like_title(&stripped) {
            phrase = stripped;
        }
    }

    let phrase = phrase.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.');
    (phrase.len() >= 3 && phrase.len() <= 80).then(|| phrase.to_string())
}

/// Job title from the subject line, e.g.
/// `Application received: SWE Intern at Acme` → `SWE Intern`.
pub fn position_from_subject(subject: &str) -> Option<String> {
    let mut subject = subject.trim();
    loop {
        let lower = subject.to_lowercase();
        let Some(prefix) = ["re:", "fwd:", "fw:"].iter().find(|p| lower.starts_with(*p)) else {
            break;
        };
        subject = subject[prefix.len()..].trim_start();
    }

    let separator = PATTERNS.subject_separator.first()?;
    separator
        .split(subject)
        .filter(|segment| looks_like_title(segment))
        .find_map(clean_position)
}

fn position_from_text(text: &str) -> Option<String> {
    PATTERNS.position.iter().find_map(|re| {
        let caps = re.captures(text)?;
        let phrase = caps.get(1)?.as_str().trim();
        (phrase.len() >= 3 && phrase.len() <= 80).then(|| phrase.to_string())
    })
}

// ── Other fields ────────────────────────────────────────────────────

fn source_platform(sender: &str, text: &str) -> Option<String> {
    let sender = sender.to_lowercase();
    if let Some((_, name)) = SOURCE_MAP.iter().find(|(d, _)| sender.contains(d)) {
        return Some(name.to_string());
    }
    let text = text.to_lowercase();
    SOURCE_MAP
        .iter()
        .find(|(d, _)| text.contains(d))
        .map(|(_, name)| name.to_string())
}

fn fallback_source(text: &str) -> &'static str {
    let text = text.to_lowercase();
    if ["company website", "career page", "careers page", "applied directly"]
        .iter()
        .any(|p| text.contains(p))
    {
        "Direct Application"
    } else {
        "Email"
    }
}

fn location(text: &str) -> Option<String> {
    let found = PATTERNS.location.iter().find_map(|re| {
        let caps = re.captures(text)?;
        let loc = caps.get(1)?.as_str().trim();
        (loc.len() > 2 && loc.len() < 100).then(|| loc.to_string())
    });
    if found.is_some() {
        return found;
    }
    let lower = text.to_lowercase();
    ["remote", "work from home"]
        .iter()
        .any(|w| lower.contains(w))
        .then(|| "Remote".to_string())
}

fn job_id(text: &str) -> Option<String> {
    PATTERNS.job_id.iter().find_map(|re| {
        re.captures_iter(text).find_map(|caps| {
            let id = caps.get(1)?.as_str();
            id.chars().any(|c| c.is_ascii_digit()).then(|| id.to_string())
        })
    })
}

/// First ATS link in the text, else the first link of any kind.
fn status_link(text: &str) -> Option<String> {
    let re = PATTERNS.url.first()?;
    let urls: Vec<&str> = re
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']))
        .collect();
    urls.iter()
        .find(|u| ATS_LINK_DOMAINS.iter().any(|d| u.contains(d)))
        .or_else(|| urls.first())
        .map(|u| u.to_string())
}

fn status_hint(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    STATUS_HINTS
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| lower.contains(p)))
        .map(|(status, _)| *status)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;

    fn msg(sender: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            id: "m1".into(),
            thread_id: None,
            sender: sender.into(),
            recipient: "me@example.com".into(),
            subject: subject.into(),
            snippet: String::new(),
            body: body.into(),
            labels: vec![],
            received_at: Utc.with_ymd_and_hms(2025, 8, 23, 15, 30, 0).unwrap(),
        }
    }

    #[test]
    fn all_patterns_compile() {
        assert_eq!(PATTERNS.company.len(), COMPANY_PATTERNS.len());
        assert_eq!(PATTERNS.position.len(), POSITION_PATTERNS.len());
        assert_eq!(PATTERNS.location.len(), LOCATION_PATTERNS.len());
        assert_eq!(PATTERNS.job_id.len(), JOB_ID_PATTERNS.len());
        assert_eq!(PATTERNS.url.len(), URL_PATTERNS.len());
        assert_eq!(PATTERNS.subject_separator.len(), SUBJECT_SEPARATORS.len());
        assert_eq!(PATTERNS.position_prefix.len(), POSITION_PREFIXES.len());
        assert_eq!(PATTERNS.position_suffix.len(), POSITION_SUFFIXES.len());
    }

    #[test]
    fn company_from_domain() {
        assert_eq!(company_from_sender("Acme Careers <jobs@mail.acme.com>").as_deref(), Some("Acme"));
        assert_eq!(company_from_sender("talent@big-corp.co.uk").as_deref(), Some("Big Corp"));
        assert_eq!(company_from_sender("someone@gmail.com"), None);
        assert_eq!(company_from_sender("no-reply@greenhouse.io"), None);
        assert_eq!(company_from_sender("no-reply@us.greenhouse-mail.io"), None);
    }

    #[test]
    fn company_from_body_when_sender_is_ats() {
        let e = RuleExtractor::run(&msg(
            "no-reply@greenhouse.io",
            "Application received",
            "Thank you for applying to Initech. We will review the Data Analyst role.",
        ));
        assert_eq!(e.fields.company.as_deref(), Some("Initech"));
        assert_eq!(e.fields.source.as_deref(), Some("Greenhouse"));
    }

    #[test]
    fn position_from_subject_segments() {
        assert_eq!(
            position_from_subject("Application received: SWE Intern at Acme").as_deref(),
            Some("SWE Intern")
        );
        assert_eq!(
            position_from_subject("Thank you for applying to Acme - Software Engineer Intern").as_deref(),
            Some("Software Engineer Intern")
        );
        assert_eq!(
            position_from_subject("Re: Your application for the Data Analyst role").as_deref(),
            Some("Data Analyst")
        );
        assert_eq!(position_from_subject("Lunch on Friday?"), None);
    }

    #[test]
    fn position_from_body() {
        assert_eq!(
            position_from_text("We received your application for the Platform Reliability position.")
                .as_deref(),
            Some("Platform Reliability")
        );
    }

    #[test]
    fn full_confirmation_email() {
        let e = RuleExtractor::run(&msg(
            "Acme Recruiting <recruiting@acme.com>",
            "Thanks for applying - Backend Engineer Intern",
            "Hi, thanks for applying! Job ID: R-20431. Location: Austin, TX\n\
             Track your status at https://boards.greenhouse.io/acme/jobs/12345.",
        ));
        let f = &e.fields;
        assert_eq!(f.company.as_deref(), Some("Acme"));
        assert_eq!(f.position.as_deref(), Some("Backend Engineer Intern"));
        assert_eq!(f.applied_date, NaiveDate::from_ymd_opt(2025, 8, 23));
        assert_eq!(f.job_id.as_deref(), Some("R-20431"));
        assert_eq!(f.location.as_deref(), Some("Austin, TX"));
        assert_eq!(
            f.status_link.as_deref(),
            Some("https://boards.greenhouse.io/acme/jobs/12345")
        );
        assert_eq!(f.source.as_deref(), Some("Greenhouse"));
        assert_eq!(f.status_hint.as_deref(), Some("Applied"));
        assert!(e.confidence >= 0.9);
    }

    #[test]
    fn rejection_hint_wins_over_applied() {
        assert_eq!(
            status_hint("Thank you for applying. Unfortunately we will not proceed."),
            Some("Rejected")
        );
    }

    #[test]
    fn unrelated_mail_has_no_position() {
        let e = RuleExtractor::run(&msg("friend@gmail.com", "Dinner?", "Pizza at 7"));
        assert!(e.fields.position.is_none());
        assert!(e.fields.company.is_none());
        assert_eq!(e.fields.source.as_deref(), Some("Email"));
    }
}
