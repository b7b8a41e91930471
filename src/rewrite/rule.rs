use regex::{Captures, Regex};
use std::{borrow::Cow, fmt, str::FromStr};

/// Separates the URL pattern from the action.
const URL_KEYWORD: &str = "url";

#[derive(thiserror::Error, Debug)]
pub enum RuleError {
    #[error("missing `url` keyword")]
    MissingKeyword,

    #[error("invalid url pattern: {0}")]
    UrlPattern(#[source] regex::Error),

    #[error("invalid substitution pattern: {0}")]
    SubPattern(#[source] regex::Error),

    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("action `{0}` takes no arguments")]
    UnexpectedArgument(Action),

    #[error("action `{0}` requires a replacement")]
    MissingArgument(Action),

    #[error("line {line}: {source}")]
    Line { line: usize, source: Box<RuleError> },
}

/// What a matching rule does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// 404 with an empty HTML body.
    Reject,
    /// 200 with an empty HTML body.
    Reject200,
    /// 200 with a transparent 1x1 PNG.
    RejectImg,
    /// 200 with `{}`.
    RejectDict,
    /// 200 with `[]`.
    RejectArray,
    Redirect302,
    Redirect307,
    RequestHeader,
    RequestBody,
    ResponseHeader,
    ResponseBody,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::Reject,
        Action::Reject200,
        Action::RejectImg,
        Action::RejectDict,
        Action::RejectArray,
        Action::Redirect302,
        Action::Redirect307,
        Action::RequestHeader,
        Action::RequestBody,
        Action::ResponseHeader,
        Action::ResponseBody,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Action::Reject => "reject",
            Action::Reject200 => "reject-200",
            Action::RejectImg => "reject-img",
            Action::RejectDict => "reject-dict",
            Action::RejectArray => "reject-array",
            Action::Redirect302 => "302",
            Action::Redirect307 => "307",
            Action::RequestHeader => "request-header",
            Action::RequestBody => "request-body",
            Action::ResponseHeader => "response-header",
            Action::ResponseBody => "response-body",
        }
    }

    /// Whether the action runs before forwarding.
    pub fn is_request_phase(self) -> bool {
        !matches!(self, Action::ResponseHeader | Action::ResponseBody)
    }

    fn arguments(self) -> Arguments {
        match self {
            Action::Reject
            | Action::Reject200
            | Action::RejectImg
            | Action::RejectDict
            | Action::RejectArray => Arguments::None,
            Action::Redirect302 | Action::Redirect307 => Arguments::Location,
            Action::RequestHeader
            | Action::RequestBody
            | Action::ResponseHeader
            | Action::ResponseBody => Arguments::Substitution,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for Action {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.keyword() == s)
            .ok_or_else(|| RuleError::UnknownAction(s.to_owned()))
    }
}

/// Split `<pattern> url <rest>` at the first `url` standing alone between
/// whitespace.
fn split_keyword(line: &str) -> Option<(&str, &str)> {
    line.match_indices(URL_KEYWORD).find_map(|(at, _)| {
        let (pattern, rest) = (&line[..at], &line[at + URL_KEYWORD.len()..]);
        let separated = pattern.ends_with(char::is_whitespace)
            && rest.starts_with(char::is_whitespace);
        let pattern = pattern.trim();
        (separated && !pattern.is_empty()).then(|| (pattern, rest.trim()))
    })
}

enum Arguments {
    None,
    Location,
    Substitution,
}

/// One compiled rewrite line.
#[derive(Clone, Debug)]
pub struct Rule {
    id: u64,
    url: Regex,
    action: Action,
    sub: Option<Regex>,
    template: String,
}

impl Rule {
    pub fn parse(line: &str) -> Result<Self, RuleError> {
        let line = line.trim();
        let (pattern, rest) = split_keyword(line).ok_or(RuleError::MissingKeyword)?;

        let (keyword, extra) = match rest.split_once(char::is_whitespace) {
            Some((keyword, extra)) => (keyword, extra.trim()),
            None => (rest, ""),
        };
        let action = keyword.parse::<Action>()?;

        let (sub, template) = match action.arguments() {
            Arguments::None if !extra.is_empty() => {
                return Err(RuleError::UnexpectedArgument(action))
            }
            Arguments::None => (None, ""),
            Arguments::Location if extra.is_empty() => {
                return Err(RuleError::MissingArgument(action))
            }
            Arguments::Location if extra.contains(char::is_whitespace) => {
                return Err(RuleError::UnexpectedArgument(action))
            }
            Arguments::Location => (None, extra),
            Arguments::Substitution if extra.is_empty() => {
                return Err(RuleError::MissingArgument(action))
            }
            Arguments::Substitution => match extra.split_once(char::is_whitespace) {
                Some((old, new)) => (
                    Some(Regex::new(old).map_err(RuleError::SubPattern)?),
                    new.trim_start(),
                ),
                None => (None, extra),
            },
        };

        let url = Regex::new(pattern).map_err(RuleError::UrlPattern)?;

        let mut rule = Rule {
            id: 0,
            url,
            action,
            sub,
            template: template.to_owned(),
        };
        rule.id = fxhash::hash64(&rule.to_string());
        Ok(rule)
    }

    /// Hash of the canonical rule text.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn url_regex(&self) -> &Regex {
        &self.url
    }

    /// The "old" pattern of a header/body rewrite.
    pub fn sub_regex(&self) -> Option<&Regex> {
        self.sub.as_ref()
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// `Location` for a redirect, expanded from the URL pattern's captures.
    pub fn redirect_location(&self, captures: &Captures<'_>) -> String {
        expand(&self.template, captures)
    }

    /// Replace every match of the substitution pattern in `text`.
    ///
    /// Each match is replaced by the template expanded with that match's own
    /// groups. Without a substitution pattern the text is returned as is.
    pub fn replace_payload<'t>(&self, text: &'t str) -> Cow<'t, str> {
        match &self.sub {
            Some(sub) => sub.replace_all(text, |caps: &Captures<'_>| expand(&self.template, caps)),
            None => Cow::Borrowed(text),
        }
    }
}

impl FromStr for Rule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rule::parse(s)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} url {}", self.url.as_str(), self.action)?;
        if let Some(sub) = &self.sub {
            write!(f, " {}", sub.as_str())?;
        }
        if !self.template.is_empty() {
            write!(f, " {}", self.template)?;
        }
        Ok(())
    }
}

/// Expand `$n` placeholders from `captures`.
///
/// `n` is the longest run of digits after the `$`. Groups that did not take
/// part in the match expand to nothing. A `$` without digits is literal.
pub(crate) fn expand(template: &str, captures: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            out.push('$');
            rest = after;
            continue;
        }

        if let Some(group) = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|index| captures.get(index))
        {
            out.push_str(group.as_str());
        }
        rest = &after[digits..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reject_rule() {
        let line = r"^https?://example\.com/resource1/3/ url reject-dict";
        let rule = Rule::parse(line).unwrap();
        assert_eq!(rule.action(), Action::RejectDict);
        assert_eq!(rule.url_regex().as_str(), r"^https?://example\.com/resource1/3/");
        assert!(rule.sub_regex().is_none());
        assert_eq!(rule.template(), "");
        assert_eq!(rule.to_string(), line);
    }

    #[test]
    fn parses_redirect_rule() {
        let line = r"^https?://example\.com/(resource2)/ url 307 https://example.com/new-$1";
        let rule = Rule::parse(line).unwrap();
        assert_eq!(rule.action(), Action::Redirect307);
        assert_eq!(rule.template(), "https://example.com/new-$1");
        assert_eq!(rule.to_string(), line);

        let url = "https://example.com/resource2/";
        let caps = rule.url_regex().captures(url).unwrap();
        assert_eq!(
            rule.redirect_location(&caps),
            "https://example.com/new-resource2"
        );
    }

    #[test]
    fn substitution_template_may_contain_spaces() {
        let line = r"^https?://example\.com/ url response-body (hello) $1 big world";
        let rule = Rule::parse(line).unwrap();
        assert_eq!(rule.action(), Action::ResponseBody);
        assert_eq!(rule.sub_regex().map(Regex::as_str), Some("(hello)"));
        assert_eq!(rule.template(), "$1 big world");
        assert_eq!(rule.to_string(), line);
    }

    #[test]
    fn fields_may_be_separated_by_tabs() {
        let rule = Rule::parse("^http://curl\\.example/\turl\treject-array").unwrap();
        assert_eq!(rule.action(), Action::RejectArray);
        assert_eq!(rule.url_regex().as_str(), r"^http://curl\.example/");
        assert_eq!(rule.to_string(), r"^http://curl\.example/ url reject-array");

        let rule = Rule::parse("^http://a/ url\tresponse-body\t(x) y").unwrap();
        assert_eq!(rule.sub_regex().map(Regex::as_str), Some("(x)"));
        assert_eq!(rule.template(), "y");
    }

    #[test]
    fn single_argument_is_template_only() {
        let rule = Rule::parse("^http://a/ url request-body replaced").unwrap();
        assert!(rule.sub_regex().is_none());
        assert_eq!(rule.template(), "replaced");
        assert_eq!(rule.replace_payload("untouched"), "untouched");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            Rule::parse("^http://a/ reject"),
            Err(RuleError::MissingKeyword)
        ));
        assert!(matches!(
            Rule::parse("^http://a/ url explode"),
            Err(RuleError::UnknownAction(action)) if action == "explode"
        ));
        assert!(matches!(
            Rule::parse("(unclosed url reject"),
            Err(RuleError::UrlPattern(_))
        ));
        assert!(matches!(
            Rule::parse("^http://a/ url response-body (bad x"),
            Err(RuleError::SubPattern(_))
        ));
        assert!(matches!(
            Rule::parse("^http://a/ url reject extra"),
            Err(RuleError::UnexpectedArgument(Action::Reject))
        ));
        assert!(matches!(
            Rule::parse("^http://a/ url 302"),
            Err(RuleError::MissingArgument(Action::Redirect302))
        ));
        assert!(matches!(
            Rule::parse("^http://a/ url 302 http://b/ http://c/"),
            Err(RuleError::UnexpectedArgument(Action::Redirect302))
        ));
        assert!(matches!(
            Rule::parse("^http://a/ url request-header"),
            Err(RuleError::MissingArgument(Action::RequestHeader))
        ));
    }

    #[test]
    fn ids_follow_canonical_text() {
        let a = Rule::parse("^http://a/ url reject").unwrap();
        let b = Rule::parse("  ^http://a/ url   reject  ").unwrap();
        let c = Rule::parse("^http://a/ url reject-200").unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn replaces_each_match_with_its_own_groups() {
        let rule = Rule::parse(r"^http://a/ url response-body (\w+)=(\d+) $2=$1").unwrap();
        assert_eq!(rule.replace_payload("a=1&b=22&c"), "1=a&22=b&c");
    }

    #[test]
    fn header_rewrite_touches_only_user_agent() {
        let rule = Rule::parse(
            r"^http://a/ url request-header (\r\n)User-Agent:.+(\r\n) $1User-Agent: X$2",
        )
        .unwrap();
        let block = "Accept: */*\r\nUser-Agent: curl/8.0\r\nX-Trace: 1\r\n";
        assert_eq!(
            rule.replace_payload(block),
            "Accept: */*\r\nUser-Agent: X\r\nX-Trace: 1\r\n"
        );
    }

    #[test]
    fn expands_placeholders() {
        let re = Regex::new(r"(a)(b)?").unwrap();
        let caps = re.captures("a").unwrap();
        assert_eq!(expand("$1-$2-$3", &caps), "a--");
        assert_eq!(expand("$$1$", &caps), "$a$");
        assert_eq!(expand("$10", &caps), "");
        assert_eq!(expand("plain", &caps), "plain");
    }

    #[test]
    fn phases() {
        assert!(Action::Reject.is_request_phase());
        assert!(Action::Redirect307.is_request_phase());
        assert!(Action::RequestBody.is_request_phase());
        assert!(!Action::ResponseHeader.is_request_phase());
        assert!(!Action::ResponseBody.is_request_phase());
    }
}
