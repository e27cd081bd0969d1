use std::{
    io::{self, IsTerminal, Read, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{Days, Local, NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use tasklog::clock;
use tasklog::codec::{self, Parsed};
use tasklog::config::{Config, DEFAULT_CONFIG_PATH, expand_home};
use tasklog::filter::{self, Filter};
use tasklog::logging;
use tasklog::render::{Layout, Printer, RecordView};
use tasklog::store::calendar_groups;
use tasklog::{Added, ClockInput, DocumentStore, Ledger, Record, RecordPatch, YamlFileStore};

#[derive(Debug, Parser)]
#[command(
    name = "tasklog",
    about = "Personal todo list and time log kept in one YAML file",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Configuration file.
    #[arg(long, global = true, env = "TASKLOG_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Ledger file; overrides the configured one.
    #[arg(short = 'f', long, global = true)]
    file: Option<PathBuf>,
    /// Emit JSON instead of text for listings.
    #[arg(long, global = true)]
    json: bool,
    #[command(flatten)]
    entry: EntryOpts,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Default, Args)]
struct EntryOpts {
    /// Read a note for the record from stdin.
    #[arg(short = 'n', long, global = true)]
    note: bool,
    /// Minutes clocked (MM or H:MM).
    #[arg(short = 'c', long, global = true, value_name = "MINS", value_parser = clock::parse_clock)]
    clock: Option<i64>,
    /// Started this long ago and finished now (MM or H:MM).
    #[arg(short = 'p', long, global = true, value_name = "MINS", value_parser = clock::parse_clock)]
    prev: Option<i64>,
    /// Start date of a listing range (YYYY-MM-DD).
    #[arg(short = 'a', long, global = true, value_name = "DATE", value_parser = codec::parse_date_arg)]
    after: Option<NaiveDate>,
    /// End date of a listing range (YYYY-MM-DD).
    #[arg(short = 'b', long, global = true, value_name = "DATE", value_parser = codec::parse_date_arg)]
    before: Option<NaiveDate>,
    /// Use the date from DAYS ago.
    #[arg(short = 'y', long, global = true, value_name = "DAYS")]
    yesterday: Option<i64>,
    /// Use today's date.
    #[arg(short = 't', long, global = true)]
    today: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Todo list, recent log entries and the running clock.
    View,
    /// Log entries with clocks and notes.
    List(TitleArgs),
    /// Log entries, one line each.
    Ls(TitleArgs),
    /// Log entries grouped by day.
    Cal(TitleArgs),
    /// Log entries plus the total time clocked on them.
    Clock(TitleArgs),
    /// Add a todo; a future date schedules it instead.
    Add(TitleArgs),
    /// Delete the todo at ID.
    Del(IdArgs),
    /// Move the todo at ID into the log and start its clock.
    Do(IdArgs),
    /// Start a new log entry.
    Log(TitleArgs),
    /// Update the last log entry and stop its clock.
    Done(TitleArgs),
    /// Move the last log entry back to the todo list.
    Undo,
    /// Add minutes to the last log entry.
    #[command(name = "addclock")]
    AddClock(MinutesArgs),
    /// Capture a quick note.
    Catch(TitleArgs),
    /// List captured notes.
    Notes(TitleArgs),
    /// Record a tic and show the time since the previous one.
    Tic,
}

#[derive(Debug, Default, Args)]
struct TitleArgs {
    /// Compact entry text: `[YYYY-MM-DD] desc +tag key:value`.
    title: Vec<String>,
}

#[derive(Debug, Args)]
struct IdArgs {
    /// Position in the todo list, as shown by `view`.
    id: usize,
}

#[derive(Debug, Args)]
struct MinutesArgs {
    /// Minutes to add (MM or H:MM).
    #[arg(value_parser = clock::parse_clock)]
    minutes: i64,
}

impl Commands {
    fn accepts_note(&self) -> bool {
        matches!(
            self,
            Commands::Add(_) | Commands::Do(_) | Commands::Log(_) | Commands::Done(_) | Commands::Catch(_)
        )
    }
}

/// Per-invocation settings shared by the handlers.
struct Session {
    now: NaiveDateTime,
    printer: Printer,
    recent: usize,
    due_soon_days: i64,
    json: bool,
}

impl Session {
    fn today(&self) -> NaiveDate {
        self.now.date()
    }

    fn views<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Vec<RecordView> {
        records
            .into_iter()
            .enumerate()
            .map(|(i, rec)| RecordView::new(i, rec, self.today(), self.due_soon_days))
            .collect()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let color = io::stdout().is_terminal();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(cli, Local::now().naive_local(), color, &mut out, &mut io::stdin())
}

/// Load, schedule, dispatch, save. A failing command leaves the file untouched.
fn run(
    cli: Cli,
    now: NaiveDateTime,
    color: bool,
    out: &mut dyn Write,
    input: &mut dyn Read,
) -> Result<()> {
    let config = Config::load(&expand_home(&cli.config))?;
    let path = match &cli.file {
        Some(file) => expand_home(file),
        None => config.ledger_path(),
    };
    let store = YamlFileStore::new(path);
    let mut ledger = Ledger::from_document(store.load()?);

    let session = Session {
        now,
        printer: Printer::new(color && config.color),
        recent: config.recent,
        due_soon_days: config.due_soon_days,
        json: cli.json,
    };
    let fired = ledger.run_schedule(session.today());
    if !fired.is_empty() {
        tracing::debug!(count = fired.len(), "scheduled items moved to todo");
    }

    execute(cli, &session, &mut ledger, out, input)?;
    store.save(&ledger.into_document())
}

fn execute(
    cli: Cli,
    session: &Session,
    ledger: &mut Ledger,
    out: &mut dyn Write,
    input: &mut dyn Read,
) -> Result<()> {
    let Cli { entry, command, .. } = cli;
    let command = command.unwrap_or(Commands::View);

    let note = if entry.note {
        if !command.accepts_note() {
            anyhow::bail!("cannot add a note for this command");
        }
        Some(read_note(input)?)
    } else {
        None
    };

    match command {
        Commands::View => handle_view(session, ledger, out),
        Commands::List(args) => handle_list(args, &entry, session, ledger, out, true),
        Commands::Ls(args) => handle_list(args, &entry, session, ledger, out, false),
        Commands::Cal(args) => handle_cal(args, &entry, session, ledger, out),
        Commands::Clock(args) => handle_clock(args, &entry, session, ledger, out),
        Commands::Add(args) => handle_add(args, &entry, note, session, ledger, out),
        Commands::Del(args) => {
            let gone = ledger.delete_todo(args.id)?;
            writeln!(out, "Deleted: {}", codec::render(&gone))?;
            Ok(())
        }
        Commands::Do(args) => {
            let id = ledger.start_todo(args.id, clock_input(&entry), session.now)?;
            attach_note(&mut ledger.log, id, note)?;
            writeln!(out, "Started: {}", codec::render(ledger.log.get(id)?))?;
            Ok(())
        }
        Commands::Log(args) => {
            let patch = entry_patch(args, &entry, session.today())?;
            let id = ledger.log_entry(patch, clock_input(&entry), session.now)?;
            attach_note(&mut ledger.log, id, note)?;
            writeln!(out, "Logged: {}", codec::render(ledger.log.get(id)?))?;
            Ok(())
        }
        Commands::Done(args) => {
            let patch = entry_patch(args, &entry, session.today())?;
            let id = ledger.finish_last(patch, clock_input(&entry), session.now)?;
            attach_note(&mut ledger.log, id, note)?;
            let rec = ledger.log.get(id)?;
            match clock::duration(rec) {
                Some(d) => writeln!(
                    out,
                    "Done: {} [{}]",
                    codec::render(rec),
                    clock::format_duration(d)
                )?,
                None => writeln!(out, "Done: {}", codec::render(rec))?,
            }
            Ok(())
        }
        Commands::Undo => {
            let id = ledger.undo_last()?;
            writeln!(out, "Back on the todo list: {}", codec::render(ledger.todo.get(id)?))?;
            Ok(())
        }
        Commands::AddClock(args) => {
            let total = ledger.add_clock(args.minutes)?;
            writeln!(out, "Total clocked: {}", clock::format_duration(total))?;
            Ok(())
        }
        Commands::Catch(args) => {
            let patch = entry_patch(args, &entry, session.today())?;
            let id = ledger.capture(patch, session.now);
            attach_note(&mut ledger.catch, id, note)?;
            writeln!(out, "Captured: {}", codec::render(ledger.catch.get(id)?))?;
            Ok(())
        }
        Commands::Notes(args) => {
            let filters = listing_filters(args, &entry, session.today())?;
            let views = session.views(ledger.catch.filtered(&filters));
            print_views(out, session, &views, Layout::Entry, true)
        }
        Commands::Tic => {
            match ledger.tic(session.now) {
                Some(gap) => writeln!(out, "Since last tic: {}", clock::format_duration(gap))?,
                None => writeln!(out, "First tic recorded")?,
            }
            Ok(())
        }
    }
}

/* ------------------------------ Handlers ------------------------------ */

fn handle_view(session: &Session, ledger: &Ledger, out: &mut dyn Write) -> Result<()> {
    let todo = session.views(ledger.todo.records());
    let recent = ledger.log.view_recent(session.recent, session.now);
    let recent_views = session.views(recent.records);

    if session.json {
        let value = serde_json::json!({
            "todo": todo,
            "recent": recent_views,
            "open_for": recent.open_for.map(clock::format_duration),
        });
        serde_json::to_writer_pretty(&mut *out, &value)?;
        writeln!(out)?;
        return Ok(());
    }

    writeln!(out, "\n{}", session.printer.section("To-do items"))?;
    for view in &todo {
        writeln!(out, "{}", session.printer.line(view, Layout::Todo, false))?;
    }
    writeln!(out, "\n{}", session.printer.section("Recent log items"))?;
    for view in &recent_views {
        writeln!(out, "{}", session.printer.line(view, Layout::Entry, false))?;
    }
    if let Some(open) = recent.open_for {
        writeln!(out, "\nLast task open for: {}", clock::format_duration(open))?;
    }
    Ok(())
}

fn handle_list(
    args: TitleArgs,
    entry: &EntryOpts,
    session: &Session,
    ledger: &Ledger,
    out: &mut dyn Write,
    verbose: bool,
) -> Result<()> {
    let filters = listing_filters(args, entry, session.today())?;
    let views = session.views(ledger.log.filtered(&filters));
    print_views(out, session, &views, Layout::Entry, verbose)
}

fn handle_cal(
    args: TitleArgs,
    entry: &EntryOpts,
    session: &Session,
    ledger: &Ledger,
    out: &mut dyn Write,
) -> Result<()> {
    let filters = listing_filters(args, entry, session.today())?;
    let mut records = ledger.log.filtered(&filters);
    records.sort_by_key(|r| (r.date.is_none(), r.date));

    if session.json {
        return print_views(out, session, &session.views(records), Layout::Calendar, false);
    }
    for group in calendar_groups(records) {
        writeln!(out, "\n{}", session.printer.day_header(group.date))?;
        for view in session.views(group.records) {
            writeln!(out, "{}", session.printer.line(&view, Layout::Calendar, false))?;
        }
    }
    Ok(())
}

fn handle_clock(
    args: TitleArgs,
    entry: &EntryOpts,
    session: &Session,
    ledger: &Ledger,
    out: &mut dyn Write,
) -> Result<()> {
    let filters = listing_filters(args, entry, session.today())?;
    let records = ledger.log.filtered(&filters);
    let total = clock::total(records.iter().copied());

    if session.json {
        let value = serde_json::json!({
            "records": session.views(records),
            "total": clock::format_duration(total),
        });
        serde_json::to_writer_pretty(&mut *out, &value)?;
        writeln!(out)?;
        return Ok(());
    }
    for view in session.views(records) {
        writeln!(out, "{}", session.printer.line(&view, Layout::Entry, false))?;
    }
    writeln!(out, "Total elapsed time: {}", clock::format_duration(total))?;
    Ok(())
}

fn handle_add(
    args: TitleArgs,
    entry: &EntryOpts,
    note: Option<String>,
    session: &Session,
    ledger: &mut Ledger,
    out: &mut dyn Write,
) -> Result<()> {
    let patch = entry_patch(args, entry, session.today())?;
    match ledger.add_todo(patch, session.today()) {
        Added::Todo(id) => {
            attach_note(&mut ledger.todo, id, note)?;
            let position = ledger.todo.position_of(id)?;
            writeln!(out, "{}. {}", position, codec::render(ledger.todo.get(id)?))?;
        }
        Added::Scheduled { index, date } => {
            if let Some(rule) = ledger.scheduler.rule_mut(index) {
                if note.is_some() {
                    rule.template.note = note;
                }
            }
            writeln!(out, "Scheduled for {}", date)?;
        }
    }
    Ok(())
}

/* ------------------------------ Helpers ------------------------------ */

fn title_text(args: TitleArgs) -> Option<String> {
    if args.title.is_empty() {
        None
    } else {
        Some(args.title.join(" "))
    }
}

/// Date from `-t` or `-y`, when the title carries none.
fn flag_date(entry: &EntryOpts, today: NaiveDate) -> Result<Option<NaiveDate>> {
    if entry.today {
        return Ok(Some(today));
    }
    let Some(days) = entry.yesterday else {
        return Ok(None);
    };
    let shifted = match u64::try_from(days) {
        Ok(back) => today.checked_sub_days(Days::new(back)),
        Err(_) => today.checked_add_days(Days::new(days.unsigned_abs())),
    };
    shifted
        .map(Some)
        .with_context(|| format!("-y {} falls outside the calendar", days))
}

fn parsed_title(args: TitleArgs, entry: &EntryOpts, today: NaiveDate) -> Result<Parsed> {
    let mut parsed = title_text(args).map(|t| codec::parse(&t)).unwrap_or_default();
    if parsed.date.is_none() {
        parsed.date = flag_date(entry, today)?;
    }
    Ok(parsed)
}

fn entry_patch(args: TitleArgs, entry: &EntryOpts, today: NaiveDate) -> Result<RecordPatch> {
    Ok(parsed_title(args, entry, today)?.into())
}

/// Title tags act as a tag spec, the title date as a single day, `-a`/`-b` as a range.
fn listing_filters(args: TitleArgs, entry: &EntryOpts, today: NaiveDate) -> Result<Vec<Filter>> {
    let parsed = parsed_title(args, entry, today)?;
    let tokens: Vec<String> = parsed
        .tags
        .iter()
        .flatten()
        .map(|t| t.to_string())
        .collect();
    Ok([
        filter::tag_spec(tokens),
        parsed.date.map(filter::on_day),
        filter::date_range(entry.after, entry.before),
    ]
    .into_iter()
    .flatten()
    .collect())
}

fn clock_input(entry: &EntryOpts) -> ClockInput {
    match (entry.prev, entry.clock) {
        (Some(minutes), _) => ClockInput::Elapsed(minutes),
        (None, Some(minutes)) => ClockInput::Minutes(minutes),
        (None, None) => ClockInput::Keep,
    }
}

fn read_note(input: &mut dyn Read) -> Result<String> {
    eprintln!("Enter note text (end with Ctrl-D):");
    let mut text = String::new();
    input
        .read_to_string(&mut text)
        .context("reading note from stdin")?;
    Ok(text.trim_end_matches('\n').to_string())
}

fn attach_note(
    store: &mut tasklog::RecordStore,
    id: tasklog::RecordId,
    note: Option<String>,
) -> Result<()> {
    if let Some(text) = note {
        store.note(id, text)?;
    }
    Ok(())
}

fn print_views(
    out: &mut dyn Write,
    session: &Session,
    views: &[RecordView],
    layout: Layout,
    verbose: bool,
) -> Result<()> {
    if session.json {
        serde_json::to_writer_pretty(&mut *out, views)?;
        writeln!(out)?;
        return Ok(());
    }
    for view in views {
        writeln!(out, "{}", session.printer.line(view, layout, verbose))?;
    }
    Ok(())
}
