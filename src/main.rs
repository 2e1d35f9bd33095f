use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use certgen::config::{self, RgbColor};
use certgen::context::AppContext;
use certgen::logging::{self, LogLevel};
use certgen::mail::{self, looks_like_address, EmailTemplate, MailTransport};
use certgen::progress::{BatchHandle, SharedProgress};
use certgen::render::{self, parse_hex_color, Alignment, CertificateRenderer, FontPainter};
use certgen::roster::{DeliveryStatus, Roster};
use certgen::userlist::{self, DuplicateCheck};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "certgen", version, about = "Render and mail personalised certificates")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clean a user list and show the resulting roster
    List(ListArgs),
    /// Render one certificate per valid recipient
    Render(RenderArgs),
    /// Email the rendered certificates
    Send(SendArgs),
    /// Authorize Gmail access and cache the token
    Auth,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// User list (text, CSV or spreadsheet); defaults to the last one used
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Which collision to flag: name or email
    #[arg(long)]
    check: Option<DuplicateCheck>,

    /// Transliterate non-Latin names to ASCII
    #[arg(long)]
    transliterate: bool,

    /// Also write a "<flags> | <name> <email>" listing to this file
    #[arg(long, value_name = "FILE")]
    listing: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[arg(long, value_name = "IMAGE")]
    template: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    userlist: Option<PathBuf>,

    /// Output directory for certificates
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Font file name, family or path
    #[arg(long)]
    font: Option<String>,

    #[arg(long)]
    font_size: Option<f32>,

    /// Text colour as #rrggbb
    #[arg(long, value_parser = parse_color_arg)]
    color: Option<RgbColor>,

    #[arg(long)]
    x: Option<f32>,

    #[arg(long)]
    y: Option<f32>,

    /// left, middle or right
    #[arg(long)]
    align: Option<Alignment>,

    /// PNG compression level (0-9)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=9))]
    compress: Option<u8>,

    /// Render a single sample certificate
    #[arg(long)]
    test_mode: bool,

    /// Worker threads (defaults to cores - 1)
    #[arg(long, short = 'j')]
    jobs: Option<usize>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long, value_name = "PATH")]
    userlist: Option<PathBuf>,

    /// Directory holding the rendered certificates
    #[arg(long, value_name = "DIR")]
    certificates: Option<PathBuf>,

    #[arg(long)]
    subject: Option<String>,

    /// HTML body read from a file
    #[arg(long, value_name = "FILE")]
    body_file: Option<PathBuf>,

    /// Sender address for this mode
    #[arg(long)]
    sender: Option<String>,

    /// Send from the test address
    #[arg(long)]
    test_mode: bool,

    /// Send a single message without attachment to this address
    #[arg(long, value_name = "ADDRESS")]
    to: Option<String>,
}

fn parse_color_arg(s: &str) -> Result<RgbColor, String> {
    parse_hex_color(s)
        .map(|rgb| RgbColor::new(rgb[0], rgb[1], rgb[2]))
        .ok_or_else(|| format!("invalid color `{s}`, expected #rrggbb"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let config = config::load(cli.config.as_deref())?;
    let mut ctx = AppContext::new(config);

    let outcome = match cli.command {
        Command::List(args) => handle_list(args, &mut ctx),
        Command::Render(args) => handle_render(args, &mut ctx),
        Command::Send(args) => handle_send(args, &mut ctx),
        Command::Auth => handle_auth(&mut ctx),
    };

    // Settings used for this run are kept for the next one.
    if let Err(err) = ctx.config.save() {
        if outcome.is_ok() {
            return Err(err);
        }
        warn!("{err:#}");
    }
    outcome
}

fn handle_list(args: ListArgs, ctx: &mut AppContext) -> Result<()> {
    if let Some(check) = args.check {
        ctx.config.certificate.duplicate_check = check;
    }
    if args.transliterate {
        ctx.config.certificate.transliterate = true;
    }
    let path = userlist_path(args.path, ctx)?;

    let ulist = userlist::load(&path, ctx.config.certificate.normalize_options())
        .with_context(|| format!("could not load user list {}", path.display()))?;
    if let Some(listing) = &args.listing {
        userlist::write_listing(&ulist, listing)?;
        info!("wrote listing to {}", listing.display());
    }

    let roster = Roster::from_ulist(&ulist);
    print_roster(&roster);
    Ok(())
}

fn handle_render(args: RenderArgs, ctx: &mut AppContext) -> Result<()> {
    {
        let cfg = &mut ctx.config;
        if let Some(template) = args.template {
            cfg.files.template = Some(template);
        }
        if let Some(output) = args.output {
            cfg.files.output_dir = output;
        }
        if let Some(font) = args.font {
            cfg.certificate.font = font;
        }
        if let Some(size) = args.font_size {
            cfg.certificate.font_size = size;
        }
        if let Some(color) = args.color {
            cfg.certificate.color = color;
        }
        if let Some(x) = args.x {
            cfg.text.x = x;
        }
        if let Some(y) = args.y {
            cfg.text.y = y;
        }
        if let Some(align) = args.align {
            cfg.text.alignment = align;
        }
        if let Some(level) = args.compress {
            cfg.certificate.compress_level = level;
        }
        if args.test_mode {
            cfg.certificate.test_mode = true;
        }
        cfg.validate()?;
    }

    let cfg = &ctx.config;
    let Some(template) = cfg.files.template.clone() else {
        bail!("no template image configured; pass --template");
    };
    let font_path = cfg.certificate.font_path(&cfg.files.fonts_dir)?;
    let painter = FontPainter::load(&font_path, cfg.certificate.font_size)?;
    let mut renderer = CertificateRenderer::open(
        &template,
        cfg.files.output_dir.clone(),
        Arc::new(painter),
        cfg.text_style(),
        cfg.certificate.compress_level,
    )?;
    if let Some(jobs) = args.jobs {
        renderer = renderer.with_threads(jobs);
    }

    let recipients = if cfg.certificate.test_mode {
        vec![render::sample_recipient()]
    } else {
        let path = userlist_path(args.userlist, ctx)?;
        let roster = ctx.load_roster(&path)?;
        let flagged = roster.flagged_count();
        if flagged > 0 {
            warn!("{flagged} flagged rows are skipped; resolve them with `certgen list`");
        }
        roster.valid_entries()
    };
    if recipients.is_empty() {
        println!("Nothing to render.");
        return Ok(());
    }

    let total = recipients.len();
    let log = Arc::clone(&ctx.log);
    let per_item = ctx.config.certificate.logging;
    let done_log = Arc::clone(&ctx.log);
    let output_dir = ctx.config.files.output_dir.clone();

    let handle = render::spawn_render(
        renderer,
        recipients,
        SharedProgress::new(),
        move |recipient| {
            if per_item {
                log.log("Created Certificate", &recipient.to_string(), LogLevel::Info);
            }
        },
        Some(Box::new(move || {
            done_log.log(
                "Certificates",
                &format!("batch finished in {}", output_dir.display()),
                LogLevel::Success,
            );
        })),
    )?;

    let rendered = watch(handle, total, "Rendering", |_| {})??;
    println!(
        "Rendered {rendered} certificate(s) into {}",
        ctx.config.files.output_dir.display()
    );
    Ok(())
}

fn handle_send(args: SendArgs, ctx: &mut AppContext) -> Result<()> {
    {
        let emailing = &mut ctx.config.emailing;
        if args.test_mode {
            emailing.test_mode = true;
        }
        if let Some(sender) = args.sender {
            if emailing.test_mode {
                emailing.test_address = sender;
            } else {
                emailing.real_address = sender;
            }
        }
        if let Some(subject) = args.subject {
            emailing.subject = subject;
        }
        if let Some(body_file) = &args.body_file {
            emailing.body = fs::read_to_string(body_file)
                .with_context(|| format!("failed to read body from {}", body_file.display()))?;
        }
    }
    if let Some(dir) = args.certificates {
        ctx.config.files.output_dir = dir;
    }

    let emailing = &ctx.config.emailing;
    let sender = emailing.sender().to_string();
    if !looks_like_address(&sender) {
        let key = if emailing.test_mode {
            "emailing.test_address"
        } else {
            "emailing.real_address"
        };
        bail!("sender address `{sender}` is not valid ({key}); pass --sender");
    }
    let template = EmailTemplate::new(sender, emailing.subject.clone(), emailing.body.clone());

    if let Some(to) = args.to {
        let client = ctx.mail_client()?;
        mail::send_single(&template, &to, client)?;
        println!("Sent message to {to}");
        return Ok(());
    }
    if ctx.config.emailing.personal_email {
        bail!("personal email mode needs a recipient; pass --to");
    }

    if !ctx.certificates_exist() {
        bail!(
            "no certificates in {}; run `certgen render` first",
            ctx.config.files.output_dir.display()
        );
    }

    let path = userlist_path(args.userlist, ctx)?;
    let mut roster = ctx.load_roster(&path)?;
    let recipients = roster.valid_entries();
    if recipients.is_empty() {
        println!("Nothing to send.");
        return Ok(());
    }

    let transport: Box<dyn MailTransport + Send> = Box::new(ctx.take_mail_client()?);
    let (tx, rx) = mpsc::channel();
    let log = Arc::clone(&ctx.log);
    let total = recipients.len();

    let handle = mail::spawn_dispatch(
        template,
        ctx.config.files.output_dir.clone(),
        transport,
        recipients,
        SharedProgress::new(),
        move |success, index| {
            let _ = tx.send((success, index));
        },
        move |report| {
            log.log(
                "Emailing",
                &format!("{} sent, {} failed", report.sent, report.failed.len()),
                LogLevel::Success,
            );
        },
    )?;

    let report = watch(handle, total, "Sending", |_| {
        for (success, index) in rx.try_iter() {
            if let Err(err) = roster.mark_delivery(index, success) {
                warn!("{err}");
            }
        }
    })??;
    for (success, index) in rx.try_iter() {
        if let Err(err) = roster.mark_delivery(index, success) {
            warn!("{err}");
        }
    }

    println!("Sent {} of {} certificate(s)", report.sent, report.total());
    let failed: Vec<_> = roster
        .rows()
        .iter()
        .filter(|row| row.status == DeliveryStatus::Failed)
        .collect();
    if !failed.is_empty() {
        println!("Failed:");
        for row in failed {
            println!("  {:>4}  {}  {}", row.index, row.name, row.email);
        }
    }
    Ok(())
}

fn handle_auth(ctx: &mut AppContext) -> Result<()> {
    ctx.mail_client()?;
    println!(
        "Gmail access authorized; token cached at {}",
        ctx.config.emailing.token_file.display()
    );
    Ok(())
}

/// Resolve the user list from the argument or the last one used, remembering it.
fn userlist_path(arg: Option<PathBuf>, ctx: &mut AppContext) -> Result<PathBuf> {
    if let Some(path) = arg {
        ctx.config.files.userlist = Some(path);
    }
    ctx.config
        .files
        .userlist
        .clone()
        .context("no user list configured; pass a path")
}

/// Poll a batch, drawing a progress bar until it completes.
fn watch<T, F>(handle: BatchHandle<T>, total: usize, label: &str, mut on_tick: F) -> Result<T>
where
    T: Send + 'static,
    F: FnMut(&BatchHandle<T>),
{
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(label.to_string());

    while !handle.is_finished() {
        pb.set_position(handle.progress().get() as u64);
        on_tick(&handle);
        thread::sleep(POLL_INTERVAL);
    }
    pb.set_position(handle.progress().get() as u64);
    on_tick(&handle);
    pb.finish_and_clear();
    handle.join()
}

fn print_roster(roster: &Roster) {
    if roster.is_empty() {
        println!("No records.");
        return;
    }
    for row in roster.rows() {
        println!(
            "{:>4}  {:<32} {:<36} {}",
            row.index, row.name, row.email, row.flags
        );
    }
    println!(
        "{} record(s), {} flagged",
        roster.len(),
        roster.flagged_count()
    );
}

