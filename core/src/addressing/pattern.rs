use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::path::{validate_module_path, ModuleId, RequestPath, CHAIN_SEPARATOR, INSTANCE_SEPARATOR};
use super::AddressingError;

/// Predicate over a single `ModuleId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleMatcher {
    /// `*`: any single module
    Any,
    /// `name` or `name:3`
    Exact {
        module_path: String,
        instance_id: Option<u32>,
    },
    /// `!term`
    Not(Box<ModuleMatcher>),
    /// `(a|b)`
    AnyOf(Vec<ModuleMatcher>),
    /// `(!a!b)`: juxtaposed terms must all match
    AllOf(Vec<ModuleMatcher>),
}

impl ModuleMatcher {
    pub fn matches(&self, module: &ModuleId) -> bool {
        match self {
            ModuleMatcher::Any => true,
            ModuleMatcher::Exact {
                module_path,
                instance_id,
            } => {
                module_path == &module.module_path
                    && instance_id.map_or(true, |id| id == module.instance_id)
            }
            ModuleMatcher::Not(inner) => !inner.matches(module),
            ModuleMatcher::AnyOf(options) => options.iter().any(|m| m.matches(module)),
            ModuleMatcher::AllOf(terms) => terms.iter().all(|m| m.matches(module)),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, ModuleMatcher::Exact { .. })
    }
}

/// How many consecutive modules one pattern position consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchTimes {
    pub min: u32,
    /// `None` is unbounded
    pub max: Option<u32>,
}

impl MatchTimes {
    pub const ONCE: MatchTimes = MatchTimes {
        min: 1,
        max: Some(1),
    };
    pub const ANY_NUMBER: MatchTimes = MatchTimes { min: 0, max: None };
    pub const AT_LEAST_ONCE: MatchTimes = MatchTimes { min: 1, max: None };

    fn allows(&self, count: u32) -> bool {
        self.max.map_or(true, |max| count <= max)
    }

    fn satisfied(&self, count: u32) -> bool {
        count >= self.min
    }

    // Counts past `min` are indistinguishable when unbounded; capping keeps the state set finite.
    fn saturate(&self, count: u32) -> u32 {
        match self.max {
            None => count.min(self.min),
            Some(_) => count,
        }
    }
}

/// One position of a parsed pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSegment {
    pub matcher: ModuleMatcher,
    pub times: MatchTimes,
}

/// Pattern over `RequestPath` chains.
///
/// Positions are separated by `->`. Each position is a single-module matcher
/// (`name`, `name:3`, `*`, `!term`, `(a|b)`, `(!a!b)`) with an optional
/// quantifier (`*`, `+`, `{n}`, `{n,m}`, `{n,}`). `**` is shorthand for any
/// number of arbitrary modules.
///
/// # Examples
///
/// ```
/// use weft_core::{RequestPath, RequestPathPattern};
///
/// let pattern: RequestPathPattern = "a->**->b".parse().unwrap();
/// assert!(pattern.test(&"a->x->y->b".parse::<RequestPath>().unwrap()));
/// assert!(pattern.test(&"a->b".parse::<RequestPath>().unwrap()));
/// assert!(!pattern.test(&"a->b->x".parse::<RequestPath>().unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestPathPattern {
    source: String,
    segments: Vec<PatternSegment>,
}

impl RequestPathPattern {
    pub fn parse(text: &str) -> Result<Self, AddressingError> {
        let source = text.trim().to_string();
        if source.is_empty() {
            return Err(AddressingError::EmptyPath);
        }
        let mut segments = Vec::new();
        let mut offset = 0;
        for part in source.split(CHAIN_SEPARATOR) {
            segments.push(SegmentParser::new(&source, part, offset, segments.len()).parse()?);
            offset += part.len() + CHAIN_SEPARATOR.len();
        }
        Ok(Self { source, segments })
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Number of positions with an exact module matcher.
    pub fn exact_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.matcher.is_exact())
            .count()
    }

    /// Whether `path` is accepted by the pattern.
    ///
    /// Explicit NFA walk: a state is `(position, matched count at that
    /// position)`; zero-width advances are explored through an epsilon
    /// closure so `**` never needs backtracking.
    pub fn test(&self, path: &RequestPath) -> bool {
        let mut states = self.closure(std::iter::once((0usize, 0u32)));
        for module in path.modules() {
            let mut next = BTreeSet::new();
            for &(index, count) in &states {
                let Some(segment) = self.segments.get(index) else {
                    continue;
                };
                if !segment.matcher.matches(module) {
                    continue;
                }
                let count = count + 1;
                if segment.times.allows(count) {
                    next.insert((index, segment.times.saturate(count)));
                }
            }
            if next.is_empty() {
                return false;
            }
            states = self.closure(next);
        }
        states.iter().any(|&(index, _)| index == self.segments.len())
    }

    fn closure(&self, seed: impl IntoIterator<Item = (usize, u32)>) -> BTreeSet<(usize, u32)> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<(usize, u32)> = seed.into_iter().collect();
        while let Some(state) = stack.pop() {
            if !out.insert(state) {
                continue;
            }
            let (index, count) = state;
            if let Some(segment) = self.segments.get(index) {
                if segment.times.satisfied(count) {
                    stack.push((index + 1, 0));
                }
            }
        }
        out
    }

    /// Priority order between two patterns.
    ///
    /// More exact matchers wins; on a tie the first position where only one
    /// of the patterns is exact decides, earlier exact positions winning.
    pub fn compare_priority(&self, other: &RequestPathPattern) -> Ordering {
        let by_count = self.exact_count().cmp(&other.exact_count());
        if by_count != Ordering::Equal {
            return by_count;
        }
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let mine = self.segments.get(i).is_some_and(|s| s.matcher.is_exact());
            let theirs = other.segments.get(i).is_some_and(|s| s.matcher.is_exact());
            if mine != theirs {
                return if mine {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
        }
        Ordering::Equal
    }
}

/// Highest-priority entry whose pattern accepts `path`.
pub fn select_best<'a, T>(
    candidates: &'a [(RequestPathPattern, T)],
    path: &RequestPath,
) -> Option<&'a T> {
    candidates
        .iter()
        .filter(|(pattern, _)| pattern.test(path))
        .fold(None, |best: Option<&'a (RequestPathPattern, T)>, entry| match best {
            Some(current) if current.0.compare_priority(&entry.0) != Ordering::Less => {
                Some(current)
            }
            _ => Some(entry),
        })
        .map(|(_, value)| value)
}

impl fmt::Display for RequestPathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for RequestPathPattern {
    type Err = AddressingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RequestPathPattern {
    type Error = AddressingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RequestPathPattern> for String {
    fn from(pattern: RequestPathPattern) -> Self {
        pattern.source
    }
}

const RESERVED: &[char] = &['|', '(', ')', '!', '*', '+', '{', '}'];

/// Recursive-descent parser for one `->`-separated position.
///
/// ```text
/// segment := "**" | alt quant?
/// alt     := concat ("|" concat)*
/// concat  := term+
/// term    := "!" term | "(" alt ")" | "*" | exact
/// quant   := "*" | "+" | "{" n "}" | "{" n "," m? "}"
/// ```
struct SegmentParser<'a> {
    pattern: &'a str,
    chars: Vec<char>,
    pos: usize,
    base_offset: usize,
    position: usize,
}

impl<'a> SegmentParser<'a> {
    fn new(pattern: &'a str, segment: &str, base_offset: usize, position: usize) -> Self {
        Self {
            pattern,
            chars: segment.chars().collect(),
            pos: 0,
            base_offset,
            position,
        }
    }

    fn parse(mut self) -> Result<PatternSegment, AddressingError> {
        self.skip_ws();
        let rest: String = self.chars[self.pos..].iter().collect();
        if rest.trim() == "**" {
            return Ok(PatternSegment {
                matcher: ModuleMatcher::Any,
                times: MatchTimes::ANY_NUMBER,
            });
        }
        let matcher = self.parse_alt()?;
        let times = self.parse_quantifier()?;
        self.skip_ws();
        if let Some(c) = self.peek() {
            return Err(self.unexpected(c));
        }
        Ok(PatternSegment { matcher, times })
    }

    fn parse_alt(&mut self) -> Result<ModuleMatcher, AddressingError> {
        let mut options = vec![self.parse_concat()?];
        while self.eat('|') {
            options.push(self.parse_concat()?);
        }
        Ok(if options.len() == 1 {
            options.remove(0)
        } else {
            ModuleMatcher::AnyOf(options)
        })
    }

    fn parse_concat(&mut self) -> Result<ModuleMatcher, AddressingError> {
        let mut terms = vec![self.parse_term()?];
        loop {
            self.skip_ws();
            match self.peek() {
                None | Some('|') | Some(')') | Some('*') | Some('+') | Some('{') => break,
                Some(_) => terms.push(self.parse_term()?),
            }
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            ModuleMatcher::AllOf(terms)
        })
    }

    fn parse_term(&mut self) -> Result<ModuleMatcher, AddressingError> {
        self.skip_ws();
        match self.peek() {
            Some('!') => {
                self.pos += 1;
                Ok(ModuleMatcher::Not(Box::new(self.parse_term()?)))
            }
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_alt()?;
                self.skip_ws();
                if !self.eat(')') {
                    return Err(AddressingError::UnbalancedGroup {
                        pattern: self.pattern.to_string(),
                    });
                }
                Ok(inner)
            }
            Some('*') => {
                self.pos += 1;
                Ok(ModuleMatcher::Any)
            }
            Some(')') => Err(AddressingError::UnbalancedGroup {
                pattern: self.pattern.to_string(),
            }),
            Some(c) if RESERVED.contains(&c) => Err(self.unexpected(c)),
            Some(_) => self.parse_exact(),
            None => Err(AddressingError::EmptyModule {
                position: self.position,
            }),
        }
    }

    fn parse_exact(&mut self) -> Result<ModuleMatcher, AddressingError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if RESERVED.contains(&c) || c.is_whitespace() {
                break;
            }
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let (module, instance) = match text.rsplit_once(INSTANCE_SEPARATOR) {
            Some((module, raw)) => {
                let id = raw
                    .parse::<u32>()
                    .map_err(|_| AddressingError::InvalidInstanceId {
                        module: module.to_string(),
                        text: raw.to_string(),
                    })?;
                (module.to_string(), Some(id))
            }
            None => (text, None),
        };
        validate_module_path(&module, self.position)?;
        Ok(ModuleMatcher::Exact {
            module_path: module,
            instance_id: instance,
        })
    }

    fn parse_quantifier(&mut self) -> Result<MatchTimes, AddressingError> {
        self.skip_ws();
        match self.peek() {
            Some('*') => {
                self.pos += 1;
                Ok(MatchTimes::ANY_NUMBER)
            }
            Some('+') => {
                self.pos += 1;
                Ok(MatchTimes::AT_LEAST_ONCE)
            }
            Some('{') => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == '}' {
                        break;
                    }
                }
                let raw: String = self.chars[start..self.pos].iter().collect();
                parse_braces(&raw)
            }
            _ => Ok(MatchTimes::ONCE),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn unexpected(&self, found: char) -> AddressingError {
        let consumed: usize = self.chars[..self.pos].iter().map(|c| c.len_utf8()).sum();
        AddressingError::Unexpected {
            found,
            offset: self.base_offset + consumed,
            pattern: self.pattern.to_string(),
        }
    }
}

fn parse_braces(raw: &str) -> Result<MatchTimes, AddressingError> {
    let invalid = || AddressingError::InvalidQuantifier {
        text: raw.to_string(),
    };
    let inner = raw
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(invalid)?;
    let parse_num = |s: &str| s.trim().parse::<u32>().map_err(|_| invalid());
    let times = match inner.split_once(',') {
        None => {
            let n = parse_num(inner)?;
            MatchTimes {
                min: n,
                max: Some(n),
            }
        }
        Some((min, max)) if max.trim().is_empty() => MatchTimes {
            min: parse_num(min)?,
            max: None,
        },
        Some((min, max)) => MatchTimes {
            min: parse_num(min)?,
            max: Some(parse_num(max)?),
        },
    };
    if times.max.is_some_and(|max| max < times.min) {
        return Err(invalid());
    }
    Ok(times)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RequestPath {
        s.parse().unwrap()
    }

    #[test]
    fn parses_quantifiers() {
        let p = RequestPathPattern::parse("a{2,3}->b+->c*->d{1,}").unwrap();
        let times: Vec<_> = p.segments().iter().map(|s| s.times).collect();
        assert_eq!(times[0], MatchTimes { min: 2, max: Some(3) });
        assert_eq!(times[1], MatchTimes::AT_LEAST_ONCE);
        assert_eq!(times[2], MatchTimes::ANY_NUMBER);
        assert_eq!(times[3], MatchTimes { min: 1, max: None });
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(matches!(
            RequestPathPattern::parse("a{3,1}"),
            Err(AddressingError::InvalidQuantifier { .. })
        ));
    }

    #[test]
    fn error_offset_is_a_byte_offset() {
        let text = "a->éé+x";
        match RequestPathPattern::parse(text) {
            Err(AddressingError::Unexpected { found, offset, .. }) => {
                assert_eq!(found, 'x');
                assert_eq!(offset, 8);
                assert_eq!(&text[offset..], "x");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_unbalanced_group() {
        assert!(matches!(
            RequestPathPattern::parse("(a|b"),
            Err(AddressingError::UnbalancedGroup { .. })
        ));
        assert!(matches!(
            RequestPathPattern::parse("a)"),
            Err(AddressingError::UnbalancedGroup { .. }) | Err(AddressingError::Unexpected { .. })
        ));
    }

    #[test]
    fn negated_conjunction_excludes_both() {
        let p = RequestPathPattern::parse("(!a!b)").unwrap();
        assert!(!p.test(&path("a")));
        assert!(!p.test(&path("b")));
        assert!(p.test(&path("c")));
    }

    #[test]
    fn bounded_repetition() {
        let p = RequestPathPattern::parse("x->a{2}->y").unwrap();
        assert!(p.test(&path("x->a->a->y")));
        assert!(!p.test(&path("x->a->y")));
        assert!(!p.test(&path("x->a->a->a->y")));
    }
}
