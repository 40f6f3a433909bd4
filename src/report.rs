//! Static HTML view of the result store.

use std::fmt::Write as _;

use toolcheck_store::{InstanceRecord, RunRecord, Snapshot, format_timestamp};

const HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">

<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Test Results</title>

    <style>
        :root{--sans-font:-apple-system,BlinkMacSystemFont,"Avenir Next",Avenir,Roboto,"Noto Sans","Segoe UI",Arial,Helvetica,sans-serif;--border-width:1px;--accent-bg:#f5f7ff;--border:#898EA4}
        table{border-collapse:collapse;margin:1.5rem 0}
        td,th{border:var(--border-width) solid var(--border);text-align:start;padding:.5rem}
        th{background-color:var(--accent-bg);font-weight:700}
        tr:nth-child(2n){background-color:var(--accent-bg)}
        body{font-family:var(--sans-font);margin:2em}
        td[data-result=PASS]{background-color:#98fb98}
        td[data-result=FAIL]{background-color:#ffb6c1}
    </style>
</head>

<body>
    <h1>Test Results</h1>
    <h2>Runs</h2>
    <table>
        <tr><th>id</th><th>start</th><th>end</th></tr>
"#;

const MIDDLE: &str = r#"    </table>

    <h2>Test Instances</h2>
    <table>
        <tr><th>run_id</th><th>env</th><th>id</th><th>status</th><th>run_result</th><th>compare_result</th></tr>
"#;

const TAIL: &str = r#"    </table>
</body>
</html>
"#;

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn push_run(out: &mut String, run: &RunRecord) {
    let end = run.end.map(format_timestamp).unwrap_or_default();
    let _ = writeln!(
        out,
        "        <tr><td>{}</td><td>{}</td><td>{}</td></tr>",
        run.id,
        format_timestamp(run.start),
        end
    );
}

fn push_instance(out: &mut String, instance: &InstanceRecord) {
    let run_result = instance.run_result.map(|r| r.as_str()).unwrap_or_default();
    let compare_result = escape(instance.compare_result.as_deref().unwrap_or_default());
    let _ = writeln!(
        out,
        "        <tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
         <td data-result='{run_result}'>{run_result}</td>\
         <td data-result='{compare_result}'>{compare_result}</td></tr>",
        instance.run_id,
        instance.env,
        escape(&instance.test_id),
        instance.status,
    );
}

/// Render every run and instance as one self-contained page.
pub fn render_report(snapshot: &Snapshot) -> String {
    let mut out = String::from(HEAD);
    for run in &snapshot.runs {
        push_run(&mut out, run);
    }
    out.push_str(MIDDLE);
    for instance in &snapshot.instances {
        push_instance(&mut out, instance);
    }
    out.push_str(TAIL);
    out
}
