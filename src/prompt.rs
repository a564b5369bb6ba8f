//! Prompt state machine for CLI devices.
//!
//! A [`PromptHandler`] classifies every line a device prints: plain output,
//! a pagination marker, an error message, a mode prompt (`router>`,
//! `router#`, `router(config)#`), or a question that needs an automatic
//! answer (enable password, save confirmation). The shell driver feeds it
//! lines and asks it for the command path between modes.

use std::collections::{HashMap, HashSet, VecDeque};

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

use crate::error::ConnectError;

const OUTPUT: usize = 0;
const MORE: usize = 1;
const ERROR: usize = 2;

/// How a question prompt is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// Send this text as-is.
    Static(String),
    /// Look the text up in the handler's dynamic parameters, e.g. the enable
    /// secret resolved at connect time.
    Param(String),
}

/// Builder collecting the patterns of one vendor CLI.
#[derive(Debug, Default)]
pub struct PromptHandlerBuilder {
    prompts: Vec<(String, Vec<String>)>,
    inputs: Vec<(String, Answer, Vec<String>)>,
    more: Vec<String>,
    errors: Vec<String>,
    ignore_errors: Vec<String>,
    edges: Vec<(String, String, String)>,
}

impl PromptHandlerBuilder {
    /// Declares a mode and the prompt patterns that identify it.
    pub fn prompt(mut self, state: &str, patterns: &[&str]) -> Self {
        self.prompts.push((
            state.to_ascii_lowercase(),
            patterns.iter().map(|p| p.to_string()).collect(),
        ));
        self
    }

    /// Declares a question the driver answers without caller involvement.
    pub fn input(mut self, state: &str, answer: Answer, patterns: &[&str]) -> Self {
        self.inputs.push((
            state.to_ascii_lowercase(),
            answer,
            patterns.iter().map(|p| p.to_string()).collect(),
        ));
        self
    }

    pub fn more(mut self, patterns: &[&str]) -> Self {
        self.more.extend(patterns.iter().map(|p| p.to_string()));
        self
    }

    pub fn errors(mut self, patterns: &[&str]) -> Self {
        self.errors.extend(patterns.iter().map(|p| p.to_string()));
        self
    }

    /// Error lines that should not fail the command.
    pub fn ignore_errors(mut self, patterns: &[&str]) -> Self {
        self.ignore_errors
            .extend(patterns.iter().map(|p| p.to_string()));
        self
    }

    /// Declares that `command` moves the device from `from` to `to`.
    pub fn edge(mut self, from: &str, command: &str, to: &str) -> Self {
        self.edges.push((
            from.to_ascii_lowercase(),
            command.to_string(),
            to.to_ascii_lowercase(),
        ));
        self
    }

    pub fn build(self) -> Result<PromptHandler, ConnectError> {
        let mut states = vec!["output".to_string(), "more".to_string(), "error".to_string()];
        let mut patterns: Vec<String> = Vec::new();
        let mut pattern_state: Vec<usize> = Vec::new();

        for pattern in self.more {
            patterns.push(pattern);
            pattern_state.push(MORE);
        }
        for pattern in self.errors {
            patterns.push(pattern);
            pattern_state.push(ERROR);
        }

        let first_prompt = states.len();
        for (state, regexes) in self.prompts {
            let index = states.len();
            states.push(state);
            for regex in regexes {
                // Devices prefix prompts with NULs and carriage returns.
                patterns.push(format!(r"^\x00*\r?{}", regex.trim_start_matches('^')));
                pattern_state.push(index);
            }
        }
        let prompt_range = (first_prompt, states.len());

        let mut answers = HashMap::new();
        for (state, answer, regexes) in self.inputs {
            let index = states.len();
            states.push(state.clone());
            answers.insert(index, answer);
            for regex in regexes {
                patterns.push(regex);
                pattern_state.push(index);
            }
        }
        answers.insert(MORE, Answer::Static(" ".to_string()));

        let all_regex = RegexSet::new(&patterns).map_err(|err| {
            ConnectError::UnsupportedTransport(format!("invalid prompt pattern: {err}"))
        })?;
        let ignore_errors = if self.ignore_errors.is_empty() {
            None
        } else {
            Some(RegexSet::new(&self.ignore_errors).map_err(|err| {
                ConnectError::UnsupportedTransport(format!("invalid ignore pattern: {err}"))
            })?)
        };

        Ok(PromptHandler {
            current: OUTPUT,
            states,
            all_regex,
            pattern_state,
            prompt_range,
            answers,
            edges: self.edges,
            ignore_errors,
            params: HashMap::new(),
            current_prompt: None,
        })
    }
}

/// Line classifier and mode navigator for one CLI session.
#[derive(Debug, Clone)]
pub struct PromptHandler {
    current: usize,
    states: Vec<String>,
    all_regex: RegexSet,
    /// Pattern index in `all_regex` to state index.
    pattern_state: Vec<usize>,
    /// Half-open range of state indices that are prompts.
    prompt_range: (usize, usize),
    answers: HashMap<usize, Answer>,
    edges: Vec<(String, String, String)>,
    ignore_errors: Option<RegexSet>,
    params: HashMap<String, String>,
    current_prompt: Option<String>,
}

impl PromptHandler {
    pub fn builder() -> PromptHandlerBuilder {
        PromptHandlerBuilder::default()
    }

    /// Sets a dynamic answer, e.g. `enable_secret`.
    pub fn set_param(&mut self, key: &str, value: String) {
        self.params.insert(key.to_string(), value);
    }

    fn classify(&self, line: &str) -> usize {
        self.all_regex
            .matches(line)
            .into_iter()
            .next()
            .and_then(|index| self.pattern_state.get(index).copied())
            .unwrap_or(OUTPUT)
    }

    fn is_prompt_state(&self, index: usize) -> bool {
        index >= self.prompt_range.0 && index < self.prompt_range.1
    }

    /// Feeds one line of device output and moves the current state.
    pub fn read(&mut self, line: &str) {
        let state = self.classify(line);
        trace!("line {:?} -> {}", line, self.states[state]);
        if state == ERROR && self.is_ignored_error(line) {
            self.current = OUTPUT;
            return;
        }
        if self.is_prompt_state(state) {
            self.current_prompt = Some(line.to_string());
        }
        self.current = state;
    }

    fn is_ignored_error(&self, line: &str) -> bool {
        self.ignore_errors
            .as_ref()
            .map(|set| set.is_match(line))
            .unwrap_or(false)
    }

    /// Whether the (possibly unterminated) line is a mode prompt.
    pub fn is_prompt(&self, line: &str) -> bool {
        self.is_prompt_state(self.classify(line))
    }

    /// Whether the line reports an error that is not on the ignore list.
    pub fn is_error(&self, line: &str) -> bool {
        self.classify(line) == ERROR && !self.is_ignored_error(line)
    }

    /// Returns the text to send when the line is a question the handler
    /// answers automatically.
    pub fn answer_for(&self, line: &str) -> Option<String> {
        match self.answers.get(&self.classify(line))? {
            Answer::Static(text) => Some(text.clone()),
            Answer::Param(key) => self.params.get(key).cloned(),
        }
    }

    pub fn current_state(&self) -> &str {
        &self.states[self.current]
    }

    pub fn current_prompt(&self) -> Option<&str> {
        self.current_prompt.as_deref()
    }

    pub fn has_state(&self, state: &str) -> bool {
        let state = state.to_ascii_lowercase();
        self.states.iter().any(|s| *s == state)
    }

    /// Shortest command path from the current mode to `target`.
    ///
    /// Each step is `(command, expected_state)`. An empty path means the
    /// device is already in `target`.
    pub fn path_to(&self, target: &str) -> Result<Vec<(String, String)>, ConnectError> {
        let target = target.to_ascii_lowercase();
        let start = self.current_state().to_string();
        if start == target {
            return Ok(Vec::new());
        }

        let mut adjacency: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();
        for (from, command, to) in &self.edges {
            adjacency
                .entry(from.as_str())
                .or_default()
                .push((to.as_str(), command.as_str()));
        }

        let mut queue = VecDeque::from([start.as_str()]);
        let mut visited = HashSet::from([start.as_str()]);
        let mut parent: HashMap<&str, (&str, &str)> = HashMap::new();

        while let Some(node) = queue.pop_front() {
            if node == target {
                break;
            }
            for &(next, command) in adjacency.get(node).into_iter().flatten() {
                if visited.insert(next) {
                    parent.insert(next, (node, command));
                    queue.push_back(next);
                }
            }
        }

        if !parent.contains_key(target.as_str()) {
            return Err(ConnectError::ProtocolError(format!(
                "no command path from mode '{start}' to '{target}'"
            )));
        }

        let mut path = Vec::new();
        let mut node = target.as_str();
        while node != start {
            let Some(&(prev, command)) = parent.get(node) else {
                break;
            };
            path.push((command.to_string(), node.to_string()));
            node = prev;
        }
        path.reverse();
        trace!("mode path {start} -> {target}: {path:?}");
        Ok(path)
    }
}

/// Strips carriage returns and backspace runs that terminals emit at the
/// start of redrawn lines.
pub static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(
        || match Regex::new(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)") {
            Ok(re) => re,
            Err(err) => panic!("invalid IGNORE_START_LINE regex: {err}"),
        },
    );
