use clap::Parser;
use lib::peer::{LogSink, NullLink, StaticDirectory};
use lib::report::{create_report_yaml, dump_run_report_to_yaml};
use lib::session::{SchedulerSession, SessionConfig};
use lib::task_loader::{load_periodic_set, load_workflow_dir};
use log::info;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[clap(
    name = "tier_sim",
    version = "1.0",
    about = "About:
    Runs one scheduling session over a periodic task set and a workflow
    directory, then dumps the placement report.
    The task directory may contain periodic.yaml and a workflows/ folder."
)]
struct ArgParser {
    ///Path to the session config YAML; defaults apply when omitted.
    #[clap(short = 'c', long = "config_path")]
    config_path: Option<String>,
    ///Path to the task set directory.
    #[clap(short = 't', long = "task_dir_path", required = true)]
    task_dir_path: String,
    ///Scheduling policy: adaptive, heft_edf, random or fuzzy.
    #[clap(short = 'p', long = "policy", default_value = "fuzzy")]
    policy: String,
    ///Path to output directory.
    #[clap(short = 'o', long = "output_dir_path", default_value = "../outputs")]
    output_dir_path: String,
    ///Label attached to the report file.
    #[clap(short = 'l', long = "run_label", default_value = "run")]
    run_label: String,
}

fn main() {
    env_logger::init();
    let arg: ArgParser = ArgParser::parse();

    let config: SessionConfig = match &arg.config_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path).expect("Failed to read the config file");
            serde_yaml::from_str(&contents).expect("Failed to parse the config file")
        }
        None => SessionConfig::default(),
    };

    let directory = Arc::new(StaticDirectory::new(config.fogs.clone(), config.cloud.clone()));
    let session = SchedulerSession::new(config, directory, Arc::new(NullLink), Arc::new(LogSink));

    session
        .start(&arg.policy, &arg.run_label)
        .expect("Failed to start the session");

    let periodic_path = Path::new(&arg.task_dir_path).join("periodic.yaml");
    if periodic_path.exists() {
        let templates = load_periodic_set(periodic_path.to_str().unwrap())
            .expect("Failed to load the periodic task set");
        info!("submitting {} periodic templates", templates.len());
        session.submit_periodic(templates);
    }

    let workflow_dir = Path::new(&arg.task_dir_path).join("workflows");
    if workflow_dir.exists() {
        let workflows = load_workflow_dir(workflow_dir.to_str().unwrap())
            .expect("Failed to load the workflow directory");
        info!("submitting {} workflows", workflows.len());
        session
            .submit_workflows(workflows)
            .expect("Workflow submission rejected");
    }

    while session.is_running() {
        thread::sleep(Duration::from_millis(50));
    }
    session.shutdown();

    let report = session.report();
    let file_path = create_report_yaml(&arg.output_dir_path, &arg.policy, &arg.run_label);
    dump_run_report_to_yaml(&file_path, &report);
    println!("report written to {}", file_path);
}
