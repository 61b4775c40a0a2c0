//! Task prompt and command line for the coding CLI.
//!
//! `CLAUDE.md` in the workspace carries the standing instructions; the prompt
//! here only names the widget and restates the two-file contract.

/// Wrap the user's request in the fixed task instructions.
pub fn compose_agent_prompt(user_prompt: &str) -> String {
    format!(
        "Build a dashboard widget for: \"{}\"\n\n\
         Follow the instructions in CLAUDE.md. \
         Write src/App.tsx and src/data.ts with realistic mock data. \
         Do NOT install any additional packages.",
        user_prompt
    )
}

/// Arguments for an unattended, line-delimited JSON run of the CLI.
pub fn cli_args(prompt: &str) -> Vec<String> {
    vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--dangerously-skip-permissions".to_string(),
        "--disallowedTools=AskUserQuestion".to_string(),
    ]
}
