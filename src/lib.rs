//! Plan-outline domain library: parse plain-text project outlines into typed
//! projects and tasks, compute a dated schedule from explicit dates,
//! dependencies, and nesting, and patch individual lines back into the text.
//!
//! The outline text is the single source of truth; everything here is a pure
//! computation over it. File I/O, rendering, and edit gestures live in the
//! callers (see `src/main.rs` for a thin CLI exerciser).

pub mod core {
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /// Icon used for projects whose header carries no leading glyph.
    pub const DEFAULT_ICON: &str = "📁";

    /* ------------------------------- IDs ------------------------------- */

    /// Stable task identifier derived from the project name and the task's
    /// 1-based position in the project's source order.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskId(pub String);

    impl TaskId {
        pub fn new(project: &str, index: usize) -> Self {
            Self(format!("{}-{}", project, index + 1))
        }
    }

    /* ----------------------------- Parsed model ----------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TaskStatus {
        #[default]
        Pending,
        InProgress,
        Done,
        Cancelled,
    }

    /// One task line as written, before any dates are computed.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ParsedTask {
        /// Nesting depth; equals the number of `>` markers on the line.
        pub level: u8,
        pub title: String,
        /// Duration in days, from the trailing `(N)`.
        pub duration: i64,
        /// Ordered 1-based indices into the same project's task sequence.
        #[serde(default)]
        pub deps: Vec<usize>,
        #[serde(default)]
        pub milestone: bool,
        #[serde(default)]
        pub done: bool,
        #[serde(default)]
        pub status: TaskStatus,
        /// Explicit color, normalized to a leading-`#` form.
        pub color: Option<String>,
        /// Explicit start date from `@start:`; pins the task when present.
        pub start: Option<NaiveDate>,
        /// Linked external note from `@note:`.
        pub note: Option<String>,
        /// 1-based source line, kept so edits can be written back.
        pub line: usize,
    }

    impl ParsedTask {
        pub fn new(level: u8, title: impl Into<String>, duration: i64, line: usize) -> Self {
            Self {
                level,
                title: title.into(),
                duration,
                deps: vec![],
                milestone: false,
                done: false,
                status: TaskStatus::Pending,
                color: None,
                start: None,
                note: None,
                line,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ParsedProject {
        pub name: String,
        /// Single display glyph; `DEFAULT_ICON` when the header has none.
        pub icon: String,
        pub note: Option<String>,
        #[serde(default)]
        pub tasks: Vec<ParsedTask>,
        pub line: usize,
    }

    /// Output of a full parse. Produced fresh on every call; parsed records
    /// carry no identity across parses.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ParseResult {
        /// Global start date; the caller's current date unless `@start:` is present.
        pub start_date: NaiveDate,
        /// Whether `start_date` came from an `@start:` directive in the text.
        #[serde(default)]
        pub explicit_start: bool,
        /// Document title from a leading `# ...` line, if any.
        pub title: Option<String>,
        /// Unrecognized `@key: value` document directives, in source order.
        #[serde(default)]
        pub meta: IndexMap<String, String>,
        #[serde(default)]
        pub projects: Vec<ParsedProject>,
    }

    /* ----------------------------- Modifiers ----------------------------- */

    /// Recognized `@key` / `@key:value` task and header modifiers. The
    /// stringly-typed token syntax is converted to this closed set at the
    /// parse boundary; unknown keys are dropped there.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Modifier {
        After(usize),
        Milestone,
        Done,
        Progress,
        Cancelled,
        Color(String),
        Start(NaiveDate),
        Note(String),
    }

    impl Modifier {
        /// Map a scanned token to a modifier. Unknown keys and malformed
        /// values (bad numbers, bad dates) yield `None` and are ignored.
        pub fn from_token(key: &str, value: Option<&str>) -> Option<Modifier> {
            match key {
                "after" => value?.trim().parse::<usize>().ok().map(Modifier::After),
                "milestone" => Some(Modifier::Milestone),
                "done" => Some(Modifier::Done),
                "progress" => Some(Modifier::Progress),
                "cancelled" | "canceled" => Some(Modifier::Cancelled),
                "color" => value.map(normalize_color).map(Modifier::Color),
                "start" => NaiveDate::parse_from_str(value?.trim(), "%Y-%m-%d")
                    .ok()
                    .map(Modifier::Start),
                "note" => value.map(|v| Modifier::Note(v.to_string())),
                _ => None,
            }
        }
    }

    pub fn normalize_color(value: &str) -> String {
        format!("#{}", value.trim().trim_start_matches('#'))
    }

    /* ----------------------------- Resolved model ----------------------------- */

    /// A task with computed dates, addressed by index in its project's arena.
    /// Parent and child links are plain indices, recomputed on every rebuild.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub id: TaskId,
        /// 0-based position within the project's flat task list.
        pub index: usize,
        pub level: u8,
        pub title: String,
        pub duration: i64,
        #[serde(default)]
        pub deps: Vec<usize>,
        #[serde(default)]
        pub milestone: bool,
        #[serde(default)]
        pub done: bool,
        #[serde(default)]
        pub status: TaskStatus,
        pub color: Option<String>,
        pub explicit_start: Option<NaiveDate>,
        pub note: Option<String>,
        pub line: usize,
        pub start: NaiveDate,
        pub end: NaiveDate,
        /// True iff an explicit start date pins this task in place.
        #[serde(default)]
        pub manually_positioned: bool,
        /// Index of the nearest preceding task with a strictly smaller level.
        pub parent: Option<usize>,
        /// Direct children, in source order.
        #[serde(default)]
        pub children: Vec<usize>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Project {
        pub name: String,
        pub icon: String,
        pub note: Option<String>,
        pub line: usize,
        /// Task arena in source order. This is also the flat task list the
        /// 1-based dependency indices point into; scheduling never reorders it.
        #[serde(default)]
        pub tasks: Vec<Task>,
        /// Indices of root-level tasks, in source order.
        #[serde(default)]
        pub roots: Vec<usize>,
        pub start: NaiveDate,
        pub end: NaiveDate,
    }

    impl Project {
        /// Ancestor chain of a task: nearest parent first, project root last.
        /// The text patcher uses this to know which ancestor lines need their
        /// reconciled durations written back.
        pub fn ancestors(&self, index: usize) -> Vec<usize> {
            let mut out = Vec::new();
            let mut cursor = self.tasks.get(index).and_then(|t| t.parent);
            while let Some(parent) = cursor {
                out.push(parent);
                cursor = self.tasks[parent].parent;
            }
            out
        }

        pub fn task_by_id(&self, id: &TaskId) -> Option<usize> {
            self.tasks.iter().position(|t| &t.id == id)
        }
    }

    /* ----------------------------- Conflicts ----------------------------- */

    #[non_exhaustive]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ConflictKind {
        DependencyViolation,
    }

    /// A detected scheduling conflict. Reported, never corrected.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Conflict {
        pub task: TaskId,
        pub kind: ConflictKind,
        pub message: String,
        #[serde(default)]
        pub related: Vec<TaskId>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Schedule {
        pub projects: Vec<Project>,
        #[serde(default)]
        pub conflicts: Vec<Conflict>,
        pub end_date: NaiveDate,
    }

    /// Result of an in-drag recalculation: an independent copy of the forest
    /// plus the task that was dragged, with its recomputed dates.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DragResult {
        pub projects: Vec<Project>,
        pub updated: Task,
    }

    /* ----------------------------- Patching ----------------------------- */

    /// Partial field update applied to a single task line.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TaskPatch {
        pub title: Option<String>,
        pub duration: Option<i64>,
        pub start: Option<NaiveDate>,
        pub status: Option<TaskStatus>,
        pub milestone: Option<bool>,
        pub color: Option<String>,
        pub note: Option<String>,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum PatchError {
        #[error("line {0} is out of range")]
        LineOutOfRange(usize),
        #[error("line {0} is not a task line")]
        NotATask(usize),
    }
}

pub mod parser {
    //! Line-oriented outline parser built on `nom`.
    //!
    //! The top-level scan classifies each line (task, project header, title,
    //! directive) and never fails: a line that matches nothing is inert, and
    //! malformed dates or numbers inside a line fall back to defaults. Only
    //! the inner combinators return parse errors.

    use crate::core::*;
    use chrono::{Local, NaiveDate};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till, take_while1},
        character::complete::{char, space0, space1},
        combinator::{map, opt, recognize, rest},
        error::VerboseError,
        multi::many1,
        sequence::{delimited, preceded, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse an outline, defaulting the global start date to today.
    pub fn parse(text: &str) -> ParseResult {
        parse_with_today(text, Local::now().date_naive())
    }

    /// Parse an outline with a caller-supplied current date. Pure; identical
    /// input always yields an identical result.
    pub fn parse_with_today(text: &str, today: NaiveDate) -> ParseResult {
        let mut result = ParseResult {
            start_date: today,
            explicit_start: false,
            title: None,
            meta: indexmap::IndexMap::new(),
            projects: Vec::new(),
        };
        let mut current: Option<ParsedProject> = None;

        for (offset, raw) in text.lines().enumerate() {
            let line_number = offset + 1;
            let line = raw.trim_end();

            if let Some(task) = parse_task_line(line, line_number) {
                // Task lines outside any project are dropped.
                if let Some(project) = current.as_mut() {
                    project.tasks.push(task);
                }
                continue;
            }
            if let Ok((header, _)) = project_marker(line) {
                if let Some(finished) = current.take() {
                    result.projects.push(finished);
                }
                current = Some(build_project(header, line_number));
                continue;
            }
            if let Ok((title, _)) = title_marker(line) {
                if result.title.is_none() {
                    result.title = Some(title.trim().to_string());
                }
                continue;
            }
            if let Ok((_, (key, value))) = directive_line(line) {
                match key {
                    "start" => {
                        // First parseable occurrence wins; malformed dates are ignored.
                        if !result.explicit_start {
                            if let Ok(date) = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d") {
                                result.start_date = date;
                                result.explicit_start = true;
                            }
                        }
                    }
                    other => {
                        result.meta.insert(other.to_string(), value.trim().to_string());
                    }
                }
                continue;
            }
            // Everything else is inert.
        }

        if let Some(finished) = current.take() {
            result.projects.push(finished);
        }
        result
    }

    /// Parse a single task line: `>`-markers, whitespace, `title (duration)`,
    /// plus `@` modifier tokens. Returns `None` for anything else.
    pub fn parse_task_line(line: &str, line_number: usize) -> Option<ParsedTask> {
        let (body, level) = task_markers(line).ok()?;
        let (text, modifiers) = extract_modifiers(body);
        let (title, duration) = split_duration(&text)?;

        let mut task = ParsedTask::new(level, title, duration, line_number);
        for modifier in modifiers {
            match modifier {
                Modifier::After(dep) => task.deps.push(dep),
                Modifier::Milestone => task.milestone = true,
                Modifier::Done => {
                    task.done = true;
                    task.status = TaskStatus::Done;
                }
                Modifier::Progress => task.status = TaskStatus::InProgress,
                Modifier::Cancelled => task.status = TaskStatus::Cancelled,
                Modifier::Color(color) => task.color = Some(color),
                Modifier::Start(date) => task.start = Some(date),
                Modifier::Note(note) => task.note = Some(note),
            }
        }
        Some(task)
    }

    /* ------------------------------- Lines ------------------------------- */

    fn task_markers(i: &str) -> PResult<'_, u8> {
        let (i, marks) = recognize(many1(char('>')))(i)?;
        let (i, _) = space1(i)?;
        Ok((i, marks.len() as u8))
    }

    fn project_marker(i: &str) -> PResult<'_, ()> {
        map(tuple((tag("##"), space1)), |_| ())(i)
    }

    fn title_marker(i: &str) -> PResult<'_, ()> {
        map(tuple((char('#'), space1)), |_| ())(i)
    }

    /// `@key:` at the start of a line, value being the rest of the line.
    /// Unlike inline tokens, directives allow whitespace after the colon.
    fn directive_line(i: &str) -> PResult<'_, (&str, &str)> {
        map(
            tuple((char('@'), key_chars, char(':'), space0, rest)),
            |(_, key, _, _, value)| (key, value),
        )(i)
    }

    fn key_chars(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(i)
    }

    fn build_project(header: &str, line: usize) -> ParsedProject {
        let (text, modifiers) = extract_modifiers(header);
        let mut note = None;
        for modifier in modifiers {
            if let Modifier::Note(value) = modifier {
                note = Some(value);
            }
        }
        let (icon, name) = split_icon(text.trim());
        ParsedProject {
            name: name.to_string(),
            icon: icon.unwrap_or_else(|| DEFAULT_ICON.to_string()),
            note,
            tasks: Vec::new(),
            line,
        }
    }

    /* ------------------------------ Tokens ------------------------------ */

    fn modifier_token(i: &str) -> PResult<'_, (&str, Option<String>)> {
        let (i, _) = char('@')(i)?;
        let (i, key) = key_chars(i)?;
        let (i, value) = opt(preceded(char(':'), token_value))(i)?;
        Ok((i, (key, value)))
    }

    fn token_value(i: &str) -> PResult<'_, String> {
        alt((
            map(
                delimited(char('"'), take_till(|c| c == '"'), char('"')),
                |s: &str| s.to_string(),
            ),
            map(take_while1(|c: char| !c.is_whitespace()), |s: &str| {
                s.to_string()
            }),
        ))(i)
    }

    /// Scan a line body left to right, peeling off `@` tokens and collecting
    /// the remaining text. Unknown keys are dropped here, at the boundary.
    fn extract_modifiers(body: &str) -> (String, Vec<Modifier>) {
        let mut text = String::new();
        let mut modifiers = Vec::new();
        let mut i = body;
        while !i.is_empty() {
            if i.starts_with('@') {
                if let Ok((remaining, (key, value))) = modifier_token(i) {
                    if let Some(modifier) = Modifier::from_token(key, value.as_deref()) {
                        modifiers.push(modifier);
                    }
                    i = remaining;
                    continue;
                }
            }
            let Some(c) = i.chars().next() else { break };
            text.push(c);
            i = &i[c.len_utf8()..];
        }
        (text, modifiers)
    }

    /// Split a token-stripped body at the last `(integer)`; the text before
    /// it is the title. No parenthesized integer means the line is not a task.
    fn split_duration(text: &str) -> Option<(String, i64)> {
        let mut found: Option<(usize, i64)> = None;
        let mut search = 0;
        while let Some(offset) = text[search..].find('(') {
            let open = search + offset;
            let tail = &text[open + 1..];
            if let Some(close) = tail.find(')') {
                let inner = &tail[..close];
                if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                    if let Ok(days) = inner.parse::<i64>() {
                        found = Some((open, days));
                    }
                }
            }
            search = open + 1;
        }
        found.map(|(open, days)| (text[..open].trim().to_string(), days))
    }

    /* ------------------------------- Icons ------------------------------- */

    /// Take a leading pictographic grapheme off a project name: one
    /// pictographic unit, extended across any zero-width-joiner sequence
    /// (family/profession emoji and the like).
    fn split_icon(text: &str) -> (Option<String>, &str) {
        let Some(mut len) = icon_unit(text) else {
            return (None, text);
        };
        while let Some(joined) = text[len..].strip_prefix('\u{200d}') {
            match icon_unit(joined) {
                Some(more) => len += '\u{200d}'.len_utf8() + more,
                None => break,
            }
        }
        (Some(text[..len].to_string()), text[len..].trim_start())
    }

    /// One pictographic codepoint plus an optional variation selector.
    fn icon_unit(text: &str) -> Option<usize> {
        let mut chars = text.chars();
        let first = chars.next()?;
        if !is_pictographic(first) {
            return None;
        }
        let mut len = first.len_utf8();
        if let Some('\u{fe0f}') = chars.next() {
            len += '\u{fe0f}'.len_utf8();
        }
        Some(len)
    }

    fn is_pictographic(c: char) -> bool {
        matches!(
            c as u32,
            0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0x2B00..=0x2BFF
        )
    }

}

pub mod format {
    //! Canonical serialization: the formal inverse of the line parser.
    //! Re-parsing a rendered line reproduces the same fields.

    use crate::core::*;

    /// Render a task line: markers, title, `(duration)`, then tokens in a
    /// fixed order. Dependency tokens keep their stored order.
    pub fn task_line(task: &ParsedTask) -> String {
        let mut out = String::new();
        out.push_str(&">".repeat(task.level as usize));
        out.push(' ');
        if !task.title.is_empty() {
            out.push_str(&task.title);
            out.push(' ');
        }
        out.push_str(&format!("({})", task.duration));
        for dep in &task.deps {
            out.push_str(&format!(" @after:{}", dep));
        }
        if let Some(date) = task.start {
            out.push_str(&format!(" @start:{}", date.format("%Y-%m-%d")));
        }
        if task.milestone {
            out.push_str(" @milestone");
        }
        match task.status {
            TaskStatus::Done => out.push_str(" @done"),
            TaskStatus::InProgress => out.push_str(" @progress"),
            TaskStatus::Cancelled => out.push_str(" @cancelled"),
            TaskStatus::Pending => {}
        }
        if let Some(color) = &task.color {
            out.push_str(&format!(" @color:{}", color));
        }
        if let Some(note) = &task.note {
            out.push_str(&format!(" @note:{}", quote_value(note)));
        }
        out
    }

    pub fn project_header(project: &ParsedProject) -> String {
        let mut out = String::new();
        out.push_str("## ");
        out.push_str(&project.icon);
        out.push(' ');
        out.push_str(&project.name);
        if let Some(note) = &project.note {
            out.push_str(&format!(" @note:{}", quote_value(note)));
        }
        out
    }

    /// Render a whole parse result back to canonical outline text.
    pub fn outline(result: &ParseResult) -> String {
        let mut out = String::new();
        if let Some(title) = &result.title {
            out.push_str("# ");
            out.push_str(title);
            out.push('\n');
        }
        if result.explicit_start {
            out.push_str(&format!(
                "@start: {}\n",
                result.start_date.format("%Y-%m-%d")
            ));
        }
        for (key, value) in &result.meta {
            out.push_str(&format!("@{}: {}\n", key, value));
        }
        for project in &result.projects {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&project_header(project));
            out.push('\n');
            for task in &project.tasks {
                out.push_str(&task_line(task));
                out.push('\n');
            }
        }
        out
    }

    fn quote_value(value: &str) -> String {
        if value.chars().any(char::is_whitespace) {
            format!("\"{}\"", value)
        } else {
            value.to_string()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::{parse_task_line, parse_with_today};
        use chrono::NaiveDate;

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn task_line_round_trips() {
            let mut task = ParsedTask::new(2, "Design review", 4, 12);
            task.deps = vec![2, 1];
            task.milestone = true;
            task.status = TaskStatus::InProgress;
            task.color = Some("#00ff00".to_string());
            task.start = Some(day(2025, 5, 1));
            task.note = Some("design doc".to_string());

            let line = task_line(&task);
            let back = parse_task_line(&line, 12).unwrap();
            assert_eq!(back.title, task.title);
            assert_eq!(back.duration, task.duration);
            assert_eq!(back.deps, task.deps);
            assert_eq!(back.milestone, task.milestone);
            assert_eq!(back.status, task.status);
            assert_eq!(back.color, task.color);
            assert_eq!(back.start, task.start);
            assert_eq!(back.note, task.note);
        }

        #[test]
        fn done_task_renders_single_status_token() {
            let mut task = ParsedTask::new(1, "Shipped", 1, 1);
            task.done = true;
            task.status = TaskStatus::Done;
            let line = task_line(&task);
            assert_eq!(line, "> Shipped (1) @done");
        }

        #[test]
        fn tokens_render_in_canonical_order() {
            let mut task = ParsedTask::new(1, "Deploy", 2, 1);
            task.deps = vec![3];
            task.start = Some(day(2025, 2, 2));
            task.milestone = true;
            task.status = TaskStatus::Cancelled;
            task.color = Some("#abc".to_string());
            task.note = Some("runbook".to_string());
            assert_eq!(
                task_line(&task),
                "> Deploy (2) @after:3 @start:2025-02-02 @milestone @cancelled @color:#abc @note:runbook"
            );
        }

        #[test]
        fn outline_round_trips_through_parse() {
            let text = "\
# Board
@start: 2025-01-01
@theme: dark

## 🚀 Launch @note:docs/plan.md
> Build (5)
> Test (3) @after:1
>> Unit pass (1)
";
            let first = parse_with_today(text, day(2024, 1, 1));
            let rendered = outline(&first);
            let second = parse_with_today(&rendered, day(2024, 1, 1));
            assert_eq!(first, second);
        }
    }
}

pub mod patch {
    //! Single-line rewriting: re-parse one task line, apply a partial update,
    //! re-serialize it in place. Edits touch exactly one line of the text.

    use crate::core::*;
    use crate::{format, parser};

    pub fn patch_line(
        text: &str,
        line_number: usize,
        patch: &TaskPatch,
    ) -> Result<String, PatchError> {
        if line_number == 0 {
            return Err(PatchError::LineOutOfRange(line_number));
        }
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let index = line_number - 1;
        if index >= lines.len() {
            return Err(PatchError::LineOutOfRange(line_number));
        }
        let Some(mut task) = parser::parse_task_line(lines[index].trim_end(), line_number) else {
            return Err(PatchError::NotATask(line_number));
        };
        apply(&mut task, patch);
        lines[index] = format::task_line(&task);
        Ok(lines.join("\n"))
    }

    fn apply(task: &mut ParsedTask, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            task.title = title.clone();
        }
        if let Some(duration) = patch.duration {
            task.duration = duration;
        }
        if let Some(start) = patch.start {
            task.start = Some(start);
        }
        if let Some(status) = patch.status {
            task.status = status;
            task.done = status == TaskStatus::Done;
        }
        if let Some(milestone) = patch.milestone {
            task.milestone = milestone;
        }
        if let Some(color) = &patch.color {
            task.color = Some(normalize_color(color));
        }
        if let Some(note) = &patch.note {
            task.note = Some(note.clone());
        }
    }

}

pub mod schedule {
    //! The schedule calculator: materialize parsed projects into task arenas,
    //! resolve every task's calendar position, reconcile parents over their
    //! children, and report (never correct) dependency conflicts.
    //!
    //! Every function here is a pure computation over value snapshots; the
    //! drag path clones the committed forest and works on the copy.

    use crate::core::*;
    use chrono::{Duration, NaiveDate};

    /// Saturating date offset. Absurd-but-parseable durations clamp to the
    /// calendar bound instead of overflowing chrono's date range.
    fn date_plus_days(date: NaiveDate, days: i64) -> NaiveDate {
        Duration::try_days(days)
            .and_then(|delta| date.checked_add_signed(delta))
            .unwrap_or(NaiveDate::MAX)
    }

    /// Full recompute. Projects are scheduled independently; the returned
    /// end date is the maximum project end (the global start date when there
    /// are no projects).
    pub fn calculate(parsed: &ParseResult) -> Schedule {
        let global_start = parsed.start_date;
        let mut projects = Vec::with_capacity(parsed.projects.len());
        let mut conflicts = Vec::new();
        for source in &parsed.projects {
            let mut project = materialize(source, global_start);
            resolve_project(&mut project, global_start);
            reconcile(&mut project);
            recompute_bounds(&mut project, global_start);
            scan_conflicts(&project, &mut conflicts);
            projects.push(project);
        }
        let end_date = projects
            .iter()
            .map(|p| p.end)
            .max()
            .unwrap_or(global_start);
        Schedule {
            projects,
            conflicts,
            end_date,
        }
    }

    /// Incremental recompute for an interactive drag. Operates on a deep
    /// copy; the committed forest is never touched. Returns `None` when the
    /// id matches no task.
    pub fn recalculate_from_drag(
        projects: &[Project],
        task: &TaskId,
        new_start: NaiveDate,
        new_duration: Option<i64>,
    ) -> Option<DragResult> {
        let mut projects = projects.to_vec();
        let (project_index, task_index) = projects
            .iter()
            .enumerate()
            .find_map(|(pi, p)| p.task_by_id(task).map(|ti| (pi, ti)))?;

        let project = &mut projects[project_index];
        {
            let target = &mut project.tasks[task_index];
            target.start = new_start;
            target.explicit_start = Some(new_start);
            target.manually_positioned = true;
            if let Some(duration) = new_duration {
                target.duration = duration;
            }
            target.end = date_plus_days(target.start, target.duration);
        }

        let mut pinned = vec![false; project.tasks.len()];
        pinned[task_index] = true;
        shift_dependents(&mut project.tasks, task_index, &mut pinned);

        reconcile(project);
        let fallback = project.start;
        recompute_bounds(project, fallback);

        let updated = project.tasks[task_index].clone();
        Some(DragResult { projects, updated })
    }

    /// Ancestor tasks of a changed task, nearest parent first. Their
    /// reconciled durations are what the text patcher writes back.
    pub fn parent_tasks_to_update<'a>(project: &'a Project, index: usize) -> Vec<&'a Task> {
        project
            .ancestors(index)
            .into_iter()
            .map(|ancestor| &project.tasks[ancestor])
            .collect()
    }

    /* ----------------------------- Arena build ----------------------------- */

    /// Build the task arena in source order, attaching parents with a level
    /// stack: pop while the top's level is >= the incoming task's level, then
    /// the new top (if any) is the parent.
    fn materialize(source: &ParsedProject, global_start: NaiveDate) -> Project {
        let mut tasks: Vec<Task> = Vec::with_capacity(source.tasks.len());
        let mut roots = Vec::new();
        let mut stack: Vec<usize> = Vec::new();

        for (index, parsed) in source.tasks.iter().enumerate() {
            while let Some(&top) = stack.last() {
                if tasks[top].level >= parsed.level {
                    stack.pop();
                } else {
                    break;
                }
            }
            let parent = stack.last().copied();
            let start = parsed.start.unwrap_or(global_start);
            let task = Task {
                id: TaskId::new(&source.name, index),
                index,
                level: parsed.level,
                title: parsed.title.clone(),
                duration: parsed.duration,
                deps: parsed.deps.clone(),
                milestone: parsed.milestone,
                done: parsed.done,
                status: parsed.status,
                color: parsed.color.clone(),
                explicit_start: parsed.start,
                note: parsed.note.clone(),
                line: parsed.line,
                start,
                end: date_plus_days(start, parsed.duration),
                manually_positioned: parsed.start.is_some(),
                parent,
                children: Vec::new(),
            };
            match parent {
                Some(p) => tasks[p].children.push(index),
                None => roots.push(index),
            }
            tasks.push(task);
            stack.push(index);
        }

        Project {
            name: source.name.clone(),
            icon: source.icon.clone(),
            note: source.note.clone(),
            line: source.line,
            tasks,
            roots,
            start: global_start,
            end: global_start,
        }
    }

    /* ----------------------------- Resolution ----------------------------- */

    #[derive(Clone, Copy, PartialEq)]
    enum Resolve {
        Pending,
        InProgress,
        Settled,
    }

    fn resolve_project(project: &mut Project, global_start: NaiveDate) {
        let mut states = vec![Resolve::Pending; project.tasks.len()];
        for index in 0..project.tasks.len() {
            resolve_task(&mut project.tasks, &mut states, index, global_start);
        }
    }

    /// Memoized recursive resolution. A task currently being resolved is
    /// marked in-progress; a reference that loops back to it resolves as
    /// `None` and the caller treats that dependency as absent, so cyclic
    /// references settle without looping or erroring.
    fn resolve_task(
        tasks: &mut [Task],
        states: &mut [Resolve],
        index: usize,
        global_start: NaiveDate,
    ) -> Option<(NaiveDate, NaiveDate)> {
        match states[index] {
            Resolve::Settled => return Some((tasks[index].start, tasks[index].end)),
            Resolve::InProgress => return None,
            Resolve::Pending => {}
        }
        states[index] = Resolve::InProgress;

        let start = if let Some(pinned) = tasks[index].explicit_start {
            pinned
        } else {
            let mut candidate = global_start;
            // A task never starts before any of its named predecessors end.
            for dep in tasks[index].deps.clone() {
                if dep == 0 || dep > tasks.len() {
                    continue;
                }
                if let Some((_, dep_end)) = resolve_task(tasks, states, dep - 1, global_start) {
                    if dep_end > candidate {
                        candidate = dep_end;
                    }
                }
            }
            if let Some(parent) = tasks[index].parent {
                let parent_span = resolve_task(tasks, states, parent, global_start);
                // Children default to running after the nearest preceding
                // same-level sibling; the first child floors at the parent's
                // start instead.
                let level = tasks[index].level;
                let sibling = tasks[parent]
                    .children
                    .iter()
                    .copied()
                    .filter(|&child| child < index && tasks[child].level == level)
                    .max();
                match sibling {
                    Some(previous) => {
                        if let Some((_, sibling_end)) =
                            resolve_task(tasks, states, previous, global_start)
                        {
                            if sibling_end > candidate {
                                candidate = sibling_end;
                            }
                        }
                    }
                    None => {
                        if let Some((parent_start, _)) = parent_span {
                            if parent_start > candidate {
                                candidate = parent_start;
                            }
                        }
                    }
                }
            }
            candidate
        };

        let end = date_plus_days(start, tasks[index].duration);
        tasks[index].start = start;
        tasks[index].end = end;
        states[index] = Resolve::Settled;
        Some((start, end))
    }

    /* --------------------------- Reconciliation --------------------------- */

    /// Bottom-up post-pass: a non-leaf task's span becomes the hull of its
    /// own resolved span and its direct children, its duration the day span
    /// of that hull (floor 1).
    fn reconcile(project: &mut Project) {
        for root in project.roots.clone() {
            reconcile_task(&mut project.tasks, root);
        }
    }

    fn reconcile_task(tasks: &mut [Task], index: usize) {
        let children = tasks[index].children.clone();
        if children.is_empty() {
            return;
        }
        for &child in &children {
            reconcile_task(tasks, child);
        }
        let mut start = tasks[index].start;
        let mut end = tasks[index].end;
        for &child in &children {
            start = start.min(tasks[child].start);
            end = end.max(tasks[child].end);
        }
        let duration = (end - start).num_days().max(1);
        tasks[index].start = start;
        tasks[index].duration = duration;
        tasks[index].end = date_plus_days(start, duration);
    }

    fn recompute_bounds(project: &mut Project, fallback: NaiveDate) {
        project.start = project
            .tasks
            .iter()
            .map(|t| t.start)
            .min()
            .unwrap_or(fallback);
        project.end = project
            .tasks
            .iter()
            .map(|t| t.end)
            .max()
            .unwrap_or(fallback);
    }

    /* ----------------------------- Conflicts ----------------------------- */

    fn scan_conflicts(project: &Project, conflicts: &mut Vec<Conflict>) {
        for task in &project.tasks {
            for &dep in &task.deps {
                if dep == 0 || dep > project.tasks.len() {
                    continue;
                }
                let predecessor = &project.tasks[dep - 1];
                if task.start < predecessor.end {
                    conflicts.push(Conflict {
                        task: task.id.clone(),
                        kind: ConflictKind::DependencyViolation,
                        message: format!(
                            "'{}' starts {} before dependency '{}' ends {}",
                            task.title, task.start, predecessor.title, predecessor.end
                        ),
                        related: vec![predecessor.id.clone()],
                    });
                }
            }
        }
    }

    /* ----------------------------- Drag shift ----------------------------- */

    /// Transitively shift forward every task whose dependency list references
    /// the changed task, whenever its start now precedes the changed end.
    /// Each dependent snaps to the new end. `pinned` holds the dragged task
    /// plus the active recursion path: a task may be re-shifted when another
    /// of its dependencies later moves past it, but a task currently being
    /// shifted is never re-entered, so cyclic reference chains terminate.
    fn shift_dependents(tasks: &mut [Task], index: usize, pinned: &mut [bool]) {
        let end = tasks[index].end;
        let reference = index + 1; // dependency indices are 1-based
        let dependents: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(i, t)| !pinned[*i] && t.deps.contains(&reference))
            .map(|(i, _)| i)
            .collect();
        for dependent in dependents {
            if !pinned[dependent] && tasks[dependent].start < end {
                tasks[dependent].start = end;
                tasks[dependent].end = date_plus_days(end, tasks[dependent].duration);
                pinned[dependent] = true;
                shift_dependents(tasks, dependent, pinned);
                pinned[dependent] = false;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_with_today;
        use chrono::NaiveDate;

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn schedule_of(text: &str) -> Schedule {
            calculate(&parse_with_today(text, day(2025, 1, 1)))
        }

        const END_TO_END: &str = "\
@start: 2025-01-01

## 🚀 Launch
> Task1 (5)
> Task2 (3) @after:1
>> Subtask (2)
> Task3 (1) @after:2 @milestone
";

        #[test]
        fn end_to_end_scenario() {
            let schedule = schedule_of(END_TO_END);
            assert!(schedule.conflicts.is_empty());

            let tasks = &schedule.projects[0].tasks;
            assert_eq!(tasks[0].start, day(2025, 1, 1));
            assert_eq!(tasks[0].end, day(2025, 1, 6));

            // Task2 keeps its own dependency-derived span; the subtask floors
            // at the parent's pre-reconciliation start.
            assert_eq!(tasks[1].start, day(2025, 1, 6));
            assert_eq!(tasks[1].end, day(2025, 1, 9));
            assert_eq!(tasks[1].duration, 3);
            assert_eq!(tasks[2].start, day(2025, 1, 6));
            assert_eq!(tasks[2].end, day(2025, 1, 8));

            assert_eq!(tasks[3].start, day(2025, 1, 9));
            assert_eq!(tasks[3].end, day(2025, 1, 10));
            assert!(tasks[3].milestone);

            assert_eq!(schedule.end_date, day(2025, 1, 10));
        }

        #[test]
        fn tree_structure_follows_levels() {
            let schedule = schedule_of(END_TO_END);
            let project = &schedule.projects[0];
            assert_eq!(project.roots, vec![0, 1, 3]);
            assert_eq!(project.tasks[1].children, vec![2]);
            assert_eq!(project.tasks[2].parent, Some(1));
            assert_eq!(project.ancestors(2), vec![1]);
            assert_eq!(parent_tasks_to_update(project, 2)[0].title, "Task2");
        }

        #[test]
        fn free_tasks_start_at_global_start() {
            let schedule = schedule_of("## P\n> A (2)\n> B (4)\n");
            let tasks = &schedule.projects[0].tasks;
            assert_eq!(tasks[0].start, day(2025, 1, 1));
            // Root tasks without dependencies do not auto-sequence.
            assert_eq!(tasks[1].start, day(2025, 1, 1));
        }

        #[test]
        fn siblings_run_sequentially_under_a_parent() {
            let schedule = schedule_of("## P\n> Parent (10)\n>> A (2)\n>> B (3)\n");
            let tasks = &schedule.projects[0].tasks;
            assert_eq!(tasks[1].start, day(2025, 1, 1));
            assert_eq!(tasks[1].end, day(2025, 1, 3));
            assert_eq!(tasks[2].start, day(2025, 1, 3));
            assert_eq!(tasks[2].end, day(2025, 1, 6));
            // Parent keeps its wider own span after reconciliation.
            assert_eq!(tasks[0].start, day(2025, 1, 1));
            assert_eq!(tasks[0].end, day(2025, 1, 11));
            assert_eq!(tasks[0].duration, 10);
        }

        #[test]
        fn pinned_sibling_ignores_sequential_default() {
            let schedule =
                schedule_of("## P\n> Parent (10)\n>> A (2)\n>> B (3) @start:2025-01-02\n");
            let tasks = &schedule.projects[0].tasks;
            assert_eq!(tasks[2].start, day(2025, 1, 2));
            assert!(tasks[2].manually_positioned);
        }

        #[test]
        fn parent_hull_grows_around_children() {
            let schedule = schedule_of("## P\n> Parent (1)\n>> A (4)\n>> B (5)\n");
            let tasks = &schedule.projects[0].tasks;
            // Children run 01-01..01-05 and 01-05..01-10; the parent's own
            // one-day span is swallowed by the hull.
            assert_eq!(tasks[0].start, day(2025, 1, 1));
            assert_eq!(tasks[0].end, day(2025, 1, 10));
            assert_eq!(tasks[0].duration, 9);
        }

        #[test]
        fn conflict_scenario_reports_exactly_one() {
            let schedule = schedule_of("## P\n> A (5)\n> B (2) @after:1 @start:2025-01-03\n");
            assert_eq!(schedule.conflicts.len(), 1);
            let conflict = &schedule.conflicts[0];
            assert_eq!(conflict.kind, ConflictKind::DependencyViolation);
            assert_eq!(conflict.task, schedule.projects[0].tasks[1].id);
            assert_eq!(
                conflict.related,
                vec![schedule.projects[0].tasks[0].id.clone()]
            );
        }

        #[test]
        fn dangling_dependency_indices_are_inert() {
            let schedule = schedule_of("## P\n> A (2) @after:9 @after:0\n");
            assert!(schedule.conflicts.is_empty());
            assert_eq!(schedule.projects[0].tasks[0].start, day(2025, 1, 1));
        }

        #[test]
        fn circular_references_settle_without_looping() {
            let schedule = schedule_of("## P\n> A (2) @after:2\n> B (3) @after:1\n");
            let tasks = &schedule.projects[0].tasks;
            // B resolves first (its back-reference to A is absorbed), then A
            // queues behind B.
            assert_eq!(tasks[1].start, day(2025, 1, 1));
            assert_eq!(tasks[1].end, day(2025, 1, 4));
            assert_eq!(tasks[0].start, day(2025, 1, 4));
            assert_eq!(tasks[0].end, day(2025, 1, 6));
        }

        #[test]
        fn empty_project_spans_the_global_start() {
            let schedule = schedule_of("## Empty\n");
            let project = &schedule.projects[0];
            assert_eq!(project.start, day(2025, 1, 1));
            assert_eq!(project.end, day(2025, 1, 1));
            assert_eq!(schedule.end_date, day(2025, 1, 1));
        }

        #[test]
        fn calculate_is_idempotent() {
            let parsed = parse_with_today(END_TO_END, day(2025, 1, 1));
            assert_eq!(calculate(&parsed), calculate(&parsed));
        }

        #[test]
        fn end_equals_start_plus_duration_everywhere() {
            let schedule = schedule_of(END_TO_END);
            for project in &schedule.projects {
                for task in &project.tasks {
                    assert_eq!(task.end, task.start + Duration::days(task.duration));
                    if !task.children.is_empty() {
                        assert!(task.duration >= 1);
                    }
                }
            }
        }

        const CHAIN: &str = "\
@start: 2025-01-01

## Chain
> T1 (2)
> T2 (2) @after:1
> T3 (2) @after:2
> Free (1)
";

        #[test]
        fn drag_shifts_transitive_dependents() {
            let committed = schedule_of(CHAIN);
            let dragged_id = committed.projects[0].tasks[0].id.clone();

            let result =
                recalculate_from_drag(&committed.projects, &dragged_id, day(2025, 1, 4), None)
                    .unwrap();

            let tasks = &result.projects[0].tasks;
            assert_eq!(tasks[0].start, day(2025, 1, 4));
            assert_eq!(tasks[0].end, day(2025, 1, 6));
            assert!(tasks[0].manually_positioned);
            assert_eq!(tasks[1].start, day(2025, 1, 6));
            assert_eq!(tasks[2].start, day(2025, 1, 8));
            // Unrelated task untouched.
            assert_eq!(tasks[3].start, day(2025, 1, 1));
            assert_eq!(result.updated.id, dragged_id);

            // The committed forest was never mutated.
            assert_eq!(committed.projects[0].tasks[1].start, day(2025, 1, 3));
        }

        #[test]
        fn drag_with_new_duration_reaches_dependents() {
            let committed = schedule_of(CHAIN);
            let dragged_id = committed.projects[0].tasks[0].id.clone();

            let result =
                recalculate_from_drag(&committed.projects, &dragged_id, day(2025, 1, 1), Some(6))
                    .unwrap();
            let tasks = &result.projects[0].tasks;
            assert_eq!(tasks[0].end, day(2025, 1, 7));
            assert_eq!(tasks[1].start, day(2025, 1, 7));
            assert_eq!(tasks[2].start, day(2025, 1, 9));
        }

        #[test]
        fn absurd_duration_saturates_instead_of_overflowing() {
            let schedule = schedule_of("## P\n> X (100000000)\n> Y (1) @after:1\n");
            let tasks = &schedule.projects[0].tasks;
            assert_eq!(tasks[0].start, day(2025, 1, 1));
            assert_eq!(tasks[0].end, NaiveDate::MAX);
            assert_eq!(tasks[1].start, NaiveDate::MAX);
            assert_eq!(schedule.end_date, NaiveDate::MAX);
        }

        #[test]
        fn drag_reshifts_task_with_a_later_dependency() {
            // T2 waits on both T1 and the later-indexed T3; after the drag it
            // must clear whichever of the two now ends last.
            let committed =
                schedule_of("## P\n> T1 (2)\n> T2 (1) @after:1 @after:3\n> T3 (2) @after:1\n");
            let tasks = &committed.projects[0].tasks;
            assert_eq!(tasks[1].start, day(2025, 1, 5));
            assert_eq!(tasks[2].start, day(2025, 1, 3));

            let dragged_id = tasks[0].id.clone();
            let result =
                recalculate_from_drag(&committed.projects, &dragged_id, day(2025, 1, 4), None)
                    .unwrap();
            let tasks = &result.projects[0].tasks;
            assert_eq!(tasks[2].start, day(2025, 1, 6));
            assert_eq!(tasks[2].end, day(2025, 1, 8));
            assert_eq!(tasks[1].start, day(2025, 1, 8));
            assert_eq!(tasks[1].end, day(2025, 1, 9));
        }

        #[test]
        fn drag_with_unknown_id_returns_none() {
            let committed = schedule_of(CHAIN);
            let missing = TaskId("nowhere-1".to_string());
            assert!(
                recalculate_from_drag(&committed.projects, &missing, day(2025, 1, 4), None)
                    .is_none()
            );
        }
    }
}

pub use format::{outline, task_line};
pub use parser::{parse, parse_task_line, parse_with_today};
pub use patch::patch_line;
pub use schedule::{calculate, parent_tasks_to_update, recalculate_from_drag};
