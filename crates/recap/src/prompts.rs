//! Task prompt templates.
//!
//! Every template carries a `<!-- SPLIT -->` marker: the text before it is
//! the cacheable system prompt, the text after is the per-call user preamble.
//! Callers split before the router sees anything; the router treats both
//! halves as opaque strings.

pub const SPLIT_MARKER: &str = "<!-- SPLIT -->";

/// `(system, user_preamble)`. A template without a marker is all system.
pub fn split_template(template: &str) -> (&str, &str) {
    match template.split_once(SPLIT_MARKER) {
        Some((system, user)) => (system.trim(), user.trim_start()),
        None => (template.trim(), ""),
    }
}

pub const ENRICH_TEMPLATE: &str = "\
You classify a software engineer's daily activity records.

For each numbered activity you receive, produce a short change summary (one
sentence, plain language, what actually changed) and an intent tag. Valid
intent tags: bugfix, feature, refactor, docs, chore, test, config, perf,
security, other.

Respond with a JSON array only, one element per activity:
[{\"index\": <number>, \"change_summary\": \"...\", \"intent\": \"...\"}]

Do not invent activities. If an activity gives too little signal, use intent
\"other\" and summarize what is visible.
<!-- SPLIT -->
Activities:
";

pub const DAILY_TEMPLATE: &str = "\
You write a concise daily work recap for one software engineer, from
structured activity records.

Write Markdown with these sections:
- A one-paragraph overview of the day.
- \"## Highlights\": the few changes that mattered, with repo names.
- \"## Details\": grouped by repository; mention reviews and discussions.

Stay factual; every statement must trace to an activity record. Keep the
whole recap under 400 words.
<!-- SPLIT -->
";

pub const WEEKLY_TEMPLATE: &str = "\
You merge a week of daily work recaps into one weekly recap for the same
engineer.

Write Markdown with a short overview paragraph, \"## Themes\" for the threads
of work that span days, and \"## By day\" with one line per day. Collapse
repetition; keep it under 500 words.
<!-- SPLIT -->
";

pub const MONTHLY_TEMPLATE: &str = "\
You merge weekly work recaps into a monthly recap for the same engineer.

Write Markdown with an overview paragraph, \"## Major work\" describing the
significant projects and their progress, and \"## Numbers\" summarizing
volume if the inputs mention it. Keep it under 600 words.
<!-- SPLIT -->
";

pub const YEARLY_TEMPLATE: &str = "\
You merge monthly work recaps into a yearly recap for the same engineer.

Write Markdown telling the story of the year: an overview, \"## Quarters\"
with the arc of each quarter, and \"## Looking back\" naming the largest
contributions. Keep it under 900 words.
<!-- SPLIT -->
";

pub const QUERY_TEMPLATE: &str = "\
You answer questions about a software engineer's past work using only the
recap documents provided. If the recaps do not contain the answer, say so
plainly. Quote repo names and dates where they help.
<!-- SPLIT -->
";

/// Template for a task name, if the task has one.
pub fn template_for(task: &str) -> Option<&'static str> {
    match task {
        "enrich" => Some(ENRICH_TEMPLATE),
        "daily" => Some(DAILY_TEMPLATE),
        "weekly" => Some(WEEKLY_TEMPLATE),
        "monthly" => Some(MONTHLY_TEMPLATE),
        "yearly" => Some(YEARLY_TEMPLATE),
        "query" => Some(QUERY_TEMPLATE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_splits_into_nonempty_system() {
        for task in ["enrich", "daily", "weekly", "monthly", "yearly", "query"] {
            let template = template_for(task).expect("template");
            let (system, _user) = split_template(template);
            assert!(!system.is_empty(), "empty system prompt for {task}");
            assert!(
                !system.contains(SPLIT_MARKER),
                "marker leaked into system for {task}"
            );
        }
    }

    #[test]
    fn split_keeps_user_preamble() {
        let (system, user) = split_template(ENRICH_TEMPLATE);
        assert!(system.contains("JSON array"));
        assert!(user.starts_with("Activities:"));
    }

    #[test]
    fn template_without_marker_is_all_system() {
        let (system, user) = split_template("just instructions");
        assert_eq!(system, "just instructions");
        assert_eq!(user, "");
    }

    #[test]
    fn unknown_task_has_no_template() {
        assert!(template_for("embed").is_none());
    }
}
