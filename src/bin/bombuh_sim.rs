use bombuh::sim::{SimConfig, SimReport, Simulation};
use bombuh::transport::ServiceOrder;
use clap::{App, Arg};
use colored::*;
use std::path::Path;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, Level};

const DEFAULT_TICKS: &str = "200";
const DEFAULT_TICK_MS: &str = "50";
const DEFAULT_ANALOG: &str = "42";

fn is_number(v: String) -> Result<(), String> {
    match v.parse::<u64>() {
        Ok(_) => Ok(()),
        Err(_) => Err("Value must be a non-negative number".into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("bombuh-sim")
        .version("0.1.0")
        .author("Bombuh Engineering Team")
        .about("💣 Bombuh component simulator - runs a demo module against a virtual bus master")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON file describing the bomb and the demo module")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ticks")
                .short("t")
                .long("ticks")
                .value_name("COUNT")
                .help("Main loop passes to run once armed")
                .takes_value(true)
                .default_value(DEFAULT_TICKS)
                .validator(is_number),
        )
        .arg(
            Arg::with_name("tick-ms")
                .long("tick-ms")
                .value_name("MS")
                .help("Virtual milliseconds per main loop pass")
                .takes_value(true)
                .default_value(DEFAULT_TICK_MS)
                .validator(is_number),
        )
        .arg(
            Arg::with_name("analog")
                .short("a")
                .long("analog")
                .value_name("READING")
                .help("Analog reading of the address-select pin")
                .takes_value(true)
                .default_value(DEFAULT_ANALOG)
                .validator(is_number),
        )
        .arg(
            Arg::with_name("order")
                .long("order")
                .value_name("ORDER")
                .help("Promise queue service order")
                .takes_value(true)
                .possible_values(&["fifo", "lifo"])
                .default_value("fifo"),
        )
        .arg(
            Arg::with_name("realtime")
                .long("realtime")
                .help("Pace ticks with the wall clock instead of running flat out"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print the final report as JSON"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match matches.value_of("config") {
        Some(path) => SimConfig::load(Path::new(path))?,
        None => SimConfig::default(),
    };
    let ticks: u64 = matches.value_of("ticks").unwrap_or(DEFAULT_TICKS).parse()?;
    let tick_ms: u64 = matches.value_of("tick-ms").unwrap_or(DEFAULT_TICK_MS).parse()?;
    let analog: u16 = matches.value_of("analog").unwrap_or(DEFAULT_ANALOG).parse()?;
    let order = match matches.value_of("order") {
        Some("lifo") => ServiceOrder::Lifo,
        _ => ServiceOrder::Fifo,
    };
    let json = matches.is_present("json");

    if !json {
        println!("{}", "💣 Bombuh Component Simulator".bright_blue().bold());
        println!("{}", "=============================".bright_blue());
    }

    let mut sim = Simulation::new(config, analog, order)?;
    if let Err(e) = sim.bring_up() {
        error!("Bring-up failed: {}", e);
        return Err(e.into());
    }
    info!(address = sim.address(), ticks, tick_ms, "Running armed game");

    let mut interval = time::interval(Duration::from_millis(tick_ms.max(1)));
    for _ in 0..ticks {
        if matches.is_present("realtime") {
            interval.tick().await;
        }
        sim.step(tick_ms)?;
        if sim.master().state().defused {
            info!("Module defused, stopping");
            break;
        }
    }

    let report = sim.report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimReport) {
    let yes_no = |flag: bool| if flag { "yes".bright_green() } else { "no".bright_red() };

    println!();
    println!("{} {}", "📋".bright_blue(), "Simulation Summary".bright_blue().bold());
    println!("  Bus address:     {}", format!("{:#04x}", report.address).bright_cyan());
    println!("  Service order:   {}", format!("{:?}", report.order).bright_cyan());
    if let Some(handshake) = &report.handshake {
        println!(
            "  Handshake:       {:?} with {} variable(s), events {:#012b}",
            handshake.descriptor.kind(),
            handshake.variables.len(),
            handshake.accepted_events.0
        );
    }
    println!("  Ticks:           {} ({} ms)", report.ticks, report.elapsed_ms);
    println!("  Configured:      {}", yes_no(report.configured));
    println!("  Armed:           {}", yes_no(report.armed));
    println!(
        "  Blinks:          {} every {} ms",
        report.blink_toggles.to_string().bright_white(),
        report.blink_interval_ms
    );
    println!(
        "  Clock:           master {} ms, component {} ms",
        report.master.clock_ms, report.synced_clock_ms
    );
    println!("  Strikes:         {}", report.master.strikes.to_string().bright_yellow());
    println!("  Defused:         {}", yes_no(report.defused));

    println!("\n{}", "📊 Bus Statistics".bright_white().bold());
    println!("  Packets received:   {}", report.client.packets_received);
    println!("  Packets rejected:   {}", report.client.packets_rejected);
    println!("  Packets sent:       {}", report.client.packets_sent);
    println!("  Events dispatched:  {}", report.client.events_dispatched);
    println!("  Polls answered:     {}", report.client.polls_answered);
    println!("  Responses handled:  {}", report.client.responses_handled);
    println!("  Requests served:    {}", report.master.requests_served);
    if report.dropped_requests > 0 || report.master.unknown_requests > 0 {
        println!(
            "{} {} dropped, {} unknown",
            "⚠️".yellow(),
            report.dropped_requests,
            report.master.unknown_requests
        );
    }
}
