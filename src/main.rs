use clap::{Arg, ArgAction, Command};
use shellgate::config::Config;
use shellgate::confirmation_ui::{ConfirmationUI, ProgressPrinter, PromptGate};
use shellgate::memory::ConversationMemory;
use shellgate::session::Session;
use std::io;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: Option<&Config>) {
    let default_level = config
        .and_then(|c| c.log_level.as_deref())
        .unwrap_or("warn")
        .to_string();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let matches = Command::new("shellgate")
        .about("Natural-language requests to shell commands, behind a safety gate")
        .long_about(
            "shellgate turns a plain-language request into a shell command, screens it against \
             safety rules, asks for confirmation, runs it with a timeout, and checks the result",
        )
        .arg(Arg::new("request")
            .help("What you want to do, e.g. \"list files in temp\"")
            .num_args(1..))
        .arg(Arg::new("set-api-key")
            .long("set-api-key")
            .help("Set the Anthropic API key")
            .value_name("API_KEY")
            .num_args(1))
        .arg(Arg::new("config")
            .long("config")
            .help("Show configuration information")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("history")
            .long("history")
            .help("Show remembered requests")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("clear-history")
            .long("clear-history")
            .help("Forget remembered requests")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("nope")
            .long("nope")
            .help("Re-run the last request with corrective feedback (defaults to its error output)")
            .value_name("FEEDBACK")
            .num_args(0..=1))
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .help("Show shell attempts and validation progress")
            .action(ArgAction::SetTrue))
        .get_matches();

    // Saving a key touches only the file, so environment overrides are neither
    // applied nor validated here.
    if let Some(api_key) = matches.get_one::<String>("set-api-key") {
        init_tracing(None);
        let mut file_config = Config::load_from_file(&Config::get_config_path()?)?.unwrap_or_default();
        file_config.set_api_key(api_key.clone())?;
        println!("✅ API key saved successfully");
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load();
    init_tracing(config.as_ref().ok());
    let config = config?;
    let verbose = matches.get_flag("verbose");

    if matches.get_flag("config") {
        config.show_config_info()?;
        return Ok(ExitCode::SUCCESS);
    }

    if matches.get_flag("history") || matches.get_flag("clear-history") {
        let mut memory = ConversationMemory::open_default(config.max_conversations);
        if matches.get_flag("clear-history") {
            memory.clear();
            println!("🧹 Conversation history cleared");
        } else {
            memory.render_history_with_io(&mut io::stdout())?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut session = Session::new(&config, verbose)?;
    let mut progress = ProgressPrinter::new(ConfirmationUI::new(verbose), io::stdout());

    let report = if matches.contains_id("nope") {
        let feedback = matches.get_one::<String>("nope").map(String::as_str);
        info!("Corrective feedback: {:?}", feedback);
        let mut gate = PromptGate::stdio(verbose);
        session.process_corrective_feedback(feedback, &mut gate, &mut progress).await?
    } else {
        let words: Vec<&str> = matches
            .get_many::<String>("request")
            .unwrap_or_default()
            .map(String::as_str)
            .collect();

        if words.is_empty() {
            let stdin = io::stdin();
            session
                .run_interactive_with_io(&mut stdin.lock(), &mut io::stdout(), &mut progress)
                .await?;
            return Ok(ExitCode::SUCCESS);
        }

        let request = words.join(" ");
        info!("Processing request: {}", request);
        let mut gate = PromptGate::stdio(verbose);
        session.process_request(&request, &mut gate, &mut progress).await?
    };

    ConfirmationUI::new(verbose).render_report(&report);
    Ok(if report.succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
