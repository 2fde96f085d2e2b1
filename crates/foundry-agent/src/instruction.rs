use foundry_core::types::WorkRequest;

/// Build the issue body that hands a ticket to the worker account.
///
/// Mentions the worker, states the intent, lists focus files and prior
/// issues, then the constraints (latest feedback first), team rules learned
/// by retrospectives, and the runtime log excerpt.
pub fn build_issue_body(worker_username: &str, request: &WorkRequest, team_rules: Option<&str>) -> String {
    let ctx = &request.context;
    let mut s = format!("@{worker_username} **Action Required**\n\n### Intent\n{}\n\n", ctx.intent.trim());

    s.push_str("### Context\n");
    s.push_str(&format!("* **Ticket:** `{}`\n", request.ticket_id));
    s.push_str(&format!("* **Session:** `{}`\n", request.session_id));
    s.push_str("* **Focus files:**\n");
    if ctx.files.is_empty() {
        s.push_str("  _No specific files identified._\n");
    } else {
        for f in &ctx.files {
            s.push_str(&format!("  - `{f}`\n"));
        }
    }
    if !ctx.issues.is_empty() {
        let refs: Vec<String> = ctx.issues.iter().map(|n| format!("#{n}")).collect();
        s.push_str(&format!("* **Related issues:** {}\n", refs.join(", ")));
    }

    s.push_str("\n### Constraints (MUST FOLLOW)\n");
    if request.constraints.is_empty() {
        s.push_str("_No specific constraints._\n");
    } else {
        for c in &request.constraints {
            s.push_str(&format!("- [ ] {c}\n"));
        }
    }
    s.push_str("- [ ] Every behaviour change ships with a test that exercises it.\n");

    if let Some(rules) = team_rules.map(str::trim).filter(|r| !r.is_empty()) {
        s.push_str("\n### Team Rules\n");
        s.push_str(rules);
        s.push('\n');
    }

    s.push_str("\n### Relevant Logs\n```text\n");
    if ctx.log_excerpt.trim().is_empty() {
        s.push_str("No logs provided.\n");
    } else {
        s.push_str(ctx.log_excerpt.trim_end());
        s.push('\n');
    }
    s.push_str("```\n");
    s
}

/// Issue title; the ticket id in parentheses keeps titles unique.
pub fn issue_title(request: &WorkRequest) -> String {
    format!("[Foundry Task] {} ({})", request.title, request.ticket_id)
}
