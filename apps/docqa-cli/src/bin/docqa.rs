use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use std::{env, io};

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};

use docqa_answer::StreamEvent;
use docqa_cli::library::{library_files, load_document};
use docqa_cli::solver::{extract_questions, solve, SolveOptions};
use docqa_cli::App;
use docqa_core::config::Config;
use docqa_core::logging::init_tracing;
use docqa_core::types::{AskHints, AskRequest, AskResponse, Engine, SearchFilter};

const USAGE: &str = "\
Usage:
  docqa ingest [<library_dir>]
  docqa ask <question> [--cloud] [--stream] [--subject S] [--module M]
                       [--engine local|cloud] [--model NAME] [--agent NAME]
  docqa solve <paper.txt> [--out FILE] [--cloud] [--subject S] [--module M]
  docqa invalidate <document_id>
  docqa clear
  docqa stats";

fn usage() -> ! {
    eprintln!("{USAGE}");
    std::process::exit(2)
}

fn flag_value(args: &[String], i: &mut usize) -> String {
    *i += 1;
    match args.get(*i) {
        Some(v) => v.clone(),
        None => {
            eprintln!("Error: {} requires a value", args[*i - 1]);
            std::process::exit(2)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {}", e);
        e
    })?;
    let args: Vec<String> = env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else { usage() };
    if !matches!(command.as_str(), "ingest" | "ask" | "solve" | "invalidate" | "clear" | "stats") {
        usage();
    }

    let app = App::build(&config).await?;
    match command.as_str() {
        "ingest" => ingest(&app, &config, rest).await,
        "ask" => ask(&app, rest).await,
        "solve" => solve_paper(&app, rest).await,
        "invalidate" => {
            let Some(document_id) = rest.first() else { usage() };
            let removed = app.ingestor.remove_document(document_id).await?;
            let evicted = app.orchestrator.invalidate(document_id);
            println!("🗑️  Removed {} chunks of {}; evicted {} cached answers", removed.len(), document_id, evicted);
            Ok(())
        }
        "clear" => {
            app.ingestor.clear().await?;
            app.orchestrator.clear();
            println!("🧹 Library and answer cache cleared");
            Ok(())
        }
        _ => {
            stats(&app);
            Ok(())
        }
    }
}

async fn ingest(app: &App, config: &Config, args: &[String]) -> anyhow::Result<()> {
    let root = args.first().map(PathBuf::from).unwrap_or_else(|| {
        let dir: String = config.get("data.library_dir").unwrap_or_else(|_| "./library".to_string());
        PathBuf::from(dir)
    });
    println!("Library Ingestion\n=================");
    println!("Library directory: {}", root.display());

    let files = library_files(&root)?;
    let started = Instant::now();
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?);

    let (mut chunks, mut failed) = (0usize, 0usize);
    for path in &files {
        let doc = load_document(&root, path)?;
        pb.set_message(doc.id.clone());
        match app.ingestor.ingest(&doc).await {
            Ok(report) => chunks += report.chunk_ids.len(),
            Err(e) => {
                failed += 1;
                pb.println(format!("⚠️  {}: {}", doc.id, e));
            }
        }
        pb.inc(1);
    }
    pb.finish_with_message("done");

    println!("\n✅ Ingested {} documents ({} chunks) in {:.1?}", files.len() - failed, chunks, started.elapsed());
    if failed > 0 {
        println!("⚠️  {} documents failed; re-run ingest to retry them", failed);
    }
    Ok(())
}

fn parse_ask(args: &[String]) -> (AskRequest, bool) {
    let mut words = Vec::new();
    let (mut use_cloud, mut stream) = (false, false);
    let mut filter = SearchFilter::default();
    let mut hints = AskHints::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--cloud" => use_cloud = true,
            "--stream" => stream = true,
            "--subject" => filter.subject = Some(flag_value(args, &mut i)),
            "--module" => filter.module = Some(flag_value(args, &mut i)),
            "--model" => hints.model = Some(flag_value(args, &mut i)),
            "--agent" => hints.agent = Some(flag_value(args, &mut i)),
            "--engine" => {
                hints.engine = match flag_value(args, &mut i).as_str() {
                    "local" => Some(Engine::Local),
                    "cloud" => Some(Engine::Cloud),
                    other => {
                        eprintln!("Error: unknown engine '{}'", other);
                        std::process::exit(2)
                    }
                }
            }
            w if !w.starts_with("--") => words.push(w.to_string()),
            other => {
                eprintln!("Error: unknown flag '{}'", other);
                std::process::exit(2)
            }
        }
        i += 1;
    }
    if words.is_empty() {
        usage();
    }
    let request = AskRequest::new(words.join(" ")).with_cloud(use_cloud).with_filter(filter).with_hints(hints);
    (request, stream)
}

async fn ask(app: &App, args: &[String]) -> anyhow::Result<()> {
    let (request, stream) = parse_ask(args);
    let started = Instant::now();
    println!("❓ {}\n", request.question);

    let response = if stream {
        let mut events = app.orchestrator.ask_stream(request);
        let mut stdout = io::stdout();
        let mut done = None;
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Fragment(text) => {
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                }
                StreamEvent::Done(response) => done = Some(response),
                StreamEvent::Error(e) => {
                    println!();
                    return Err(e.into());
                }
            }
        }
        println!();
        match done {
            Some(response) => response,
            None => anyhow::bail!("answer stream ended without a result"),
        }
    } else {
        let response = app.orchestrator.ask(request).await?;
        println!("{}", response.answer_text);
        response
    };

    print_footer(&response);
    println!("⏱️  {:.2?}", started.elapsed());
    Ok(())
}

async fn solve_paper(app: &App, args: &[String]) -> anyhow::Result<()> {
    let mut paper = None;
    let mut out = None;
    let mut options = SolveOptions::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--cloud" => options.use_cloud = true,
            "--out" => out = Some(PathBuf::from(flag_value(args, &mut i))),
            "--subject" => options.filter.subject = Some(flag_value(args, &mut i)),
            "--module" => options.filter.module = Some(flag_value(args, &mut i)),
            p if !p.starts_with("--") => paper = Some(PathBuf::from(p)),
            other => {
                eprintln!("Error: unknown flag '{}'", other);
                std::process::exit(2)
            }
        }
        i += 1;
    }
    let Some(paper) = paper else { usage() };
    let text = std::fs::read_to_string(&paper)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", paper.display(), e))?;
    let questions = extract_questions(&text);
    println!("Question Paper Solver\n=====================");
    println!("📄 {} ({} questions)", paper.display(), questions.len());
    if questions.is_empty() {
        println!("⚠️  No questions found; is the paper plain text with numbered questions?");
        return Ok(());
    }

    let out = out.unwrap_or_else(|| {
        let stem = paper.file_stem().map_or_else(|| "paper".into(), |s| s.to_string_lossy().into_owned());
        PathBuf::from(format!("{stem}_solutions.txt"))
    });
    options.paper_name = paper.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned());

    let pb = ProgressBar::new(questions.len() as u64);
    pb.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?);
    let mut file = io::BufWriter::new(std::fs::File::create(&out)?);
    let summary = solve(&app.orchestrator, &questions, &options, &mut file, |n, q, ok| {
        if !ok {
            pb.println(format!("❌ Q{}: {}", n, q.text));
        }
        pb.inc(1);
    })
    .await?;
    pb.finish_and_clear();

    println!("\n✅ Solved: {}", summary.solved);
    println!("❌ Failed: {}", summary.failed);
    println!("📄 Output: {}", out.display());
    Ok(())
}

fn print_footer(response: &AskResponse) {
    if !response.sources.is_empty() {
        println!("\n📚 Sources:");
        for (i, s) in response.sources.iter().enumerate() {
            println!("  [{}] {} (page {}) score {:.3}", i + 1, s.document_id, s.page, s.score);
        }
    }
    let engine = response.engine_used.map_or("none", Engine::as_str);
    let reason = response.routing.map(|r| format!("{:?}", r.reason)).unwrap_or_else(|| "-".to_string());
    println!(
        "\n🤖 engine: {}  reason: {}  confidence: {:.3}  cached: {}",
        engine, reason, response.confidence, response.cached
    );
}

fn stats(app: &App) {
    let stats = app.vectors.stats();
    println!("📊 Library");
    println!("  documents: {}", stats.documents);
    println!("  chunks:    {}", stats.chunks);
    println!("  subjects:  {}", stats.subjects.iter().cloned().collect::<Vec<_>>().join(", "));
    println!("  modules:   {}", stats.modules.iter().cloned().collect::<Vec<_>>().join(", "));
    println!("  cached answers: {}", app.orchestrator.cache().len());
    println!("  cloud configured: {}", app.orchestrator.cloud_configured());
    println!("  index dir: {}", app.settings.storage.index_dir);
}
