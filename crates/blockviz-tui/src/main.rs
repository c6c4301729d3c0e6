//! Terminal UI for the blockviz chain integrity engine.
use std::{collections::HashMap, io, path::PathBuf, time::Duration};

use anyhow::Result;
use blockviz_core::{
    calculate_hash, mine, now_millis,
    pow::{is_valid_hash, leading_zero_digits},
    validate::check_block,
    Block as ChainBlock, ChainState, Engine, EngineConfig, HexDigest, MiningHandle, Payload,
    Transaction,
};
use clap::Parser;
use crossterm::{
    event::{self, Event as CEvent, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    layout::{Constraint, Direction, Flex, Layout, Rect},
    prelude::*,
    widgets::*,
    Frame,
};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug, Clone)]
struct Args {
    /// JSON engine config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Starting difficulty for new blocks
    #[arg(short, long)]
    difficulty: Option<u32>,
    /// Hash attempts between mining yields
    #[arg(long)]
    batch_size: Option<u64>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Tab {
    #[default]
    Chain,
    AddBlock,
    HashDemo,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum AddMode {
    #[default]
    Text,
    Transactions,
}

struct App {
    engine: Engine,
    tab: Tab,
    snapshot: ChainState,
    chain_state: TableState,
    // in-flight mining tasks by run id
    mining: HashMap<u64, MiningHandle>,
    status: Option<String>,
    detail_popup: bool,
    // edit buffer for the selected block's text
    editing: Option<String>,
    // add block form
    add_mode: AddMode,
    add_input: String,
    pending_txs: Vec<Transaction>,
    // hash demo: a candidate next block hashed with the real block fields
    hash_input: String,
    hash_nonce: u64,
    hash_timestamp: u64,
    hash_output: String,
    hash_leading_zeros: u32,
}

// Chain table shows this many hash characters
const SHORT_HASH: usize = 16;
// Nonce search in the hash demo blocks the UI, so keep it short
const DEMO_SEARCH_MAX_DIFFICULTY: u32 = 5;

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(SHORT_HASH)]
}

impl App {
    fn new(engine: Engine) -> Self {
        let snapshot = engine.snapshot();
        let mut app = Self {
            engine,
            tab: Tab::Chain,
            snapshot,
            chain_state: TableState::default(),
            mining: HashMap::new(),
            status: None,
            detail_popup: false,
            editing: None,
            add_mode: AddMode::Text,
            add_input: String::new(),
            pending_txs: Vec::new(),
            hash_input: String::new(),
            hash_nonce: 0,
            hash_timestamp: now_millis(),
            hash_output: String::new(),
            hash_leading_zeros: 0,
        };
        app.update_hash_demo();
        app
    }

    /// Pull a fresh snapshot and drop handles of finished mining tasks.
    fn refresh(&mut self) {
        self.snapshot = self.engine.snapshot();
        self.mining.retain(|_, handle| !handle.is_finished());
        self.chain_state.select(self.snapshot.selected_block);
        self.update_hash_demo();
    }

    fn selected(&self) -> Option<usize> {
        self.snapshot.selected_block
    }

    fn select(&mut self, index: Option<usize>) {
        self.engine.select(index);
        self.refresh();
    }

    fn next_row(&mut self) {
        let len = self.snapshot.len();
        let i = match self.selected() {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        self.select(Some(i));
    }

    fn previous_row(&mut self) {
        let len = self.snapshot.len();
        let i = match self.selected() {
            Some(0) | None => len.saturating_sub(1),
            Some(i) => i - 1,
        };
        self.select(Some(i));
    }

    fn report<E: std::fmt::Display>(&mut self, result: std::result::Result<(), E>, ok: String) {
        self.status = Some(match result {
            Ok(()) => ok,
            Err(e) => format!("rejected: {e}"),
        });
        self.refresh();
    }

    fn mine_selected(&mut self) {
        let Some(index) = self.selected() else {
            self.status = Some("select a block to mine".into());
            return;
        };
        let result = self.engine.start_mining(index).map(|handle| {
            self.mining.insert(handle.run(), handle);
        });
        self.report(result, format!("mining block {index}"));
    }

    fn cancel_selected(&mut self) {
        let Some(index) = self.selected() else {
            return;
        };
        let handle = self
            .snapshot
            .mining_run(index)
            .and_then(|run| self.mining.get(&run));
        match handle {
            Some(handle) => {
                handle.cancel();
                self.status = Some(format!("cancelling block {index}"));
            }
            None => self.status = Some(format!("block {index} is not mining")),
        }
    }

    fn move_selected(&mut self, up: bool) {
        let Some(from) = self.selected() else {
            return;
        };
        let to = if up { from.saturating_sub(1) } else { from + 1 };
        let result = self.engine.reorder(from, to);
        self.report(result, format!("moved block {from} to {to}"));
    }

    fn change_difficulty(&mut self, up: bool) {
        let current = self.snapshot.difficulty;
        let next = if up { (current + 1).min(8) } else { current.saturating_sub(1) };
        self.engine.set_difficulty(next);
        self.status = Some(format!("difficulty for new blocks: {next}"));
        self.refresh();
    }

    fn begin_edit(&mut self) {
        let Some(block) = self.selected().and_then(|i| self.snapshot.block(i)) else {
            return;
        };
        if block.is_genesis() {
            self.status = Some("the genesis block cannot be edited".into());
            return;
        }
        self.editing = Some(block.payload.to_string());
    }

    fn commit_edit(&mut self) {
        let (Some(text), Some(index)) = (self.editing.take(), self.selected()) else {
            return;
        };
        let result = self.engine.update_data(index, text);
        self.report(result, format!("edited block {index}; downstream blocks invalidated"));
    }

    fn submit_add(&mut self) {
        match self.add_mode {
            AddMode::Text => {
                let text = self.add_input.trim().to_string();
                if text.is_empty() {
                    self.status = Some("enter some block data first".into());
                    return;
                }
                self.engine.append(text);
                self.add_input.clear();
                self.refresh();
                self.status = Some(format!("appended block {}", self.snapshot.len() - 1));
            }
            AddMode::Transactions if self.add_input.trim().is_empty() => {
                if self.pending_txs.is_empty() {
                    self.status = Some("add at least one transaction first".into());
                    return;
                }
                let txs = std::mem::take(&mut self.pending_txs);
                self.engine.append(Payload::from(txs));
                self.refresh();
                self.status = Some(format!("appended block {}", self.snapshot.len() - 1));
            }
            AddMode::Transactions => match parse_tx(&self.add_input) {
                Some(tx) => {
                    self.pending_txs.push(tx);
                    self.add_input.clear();
                    self.status = Some(format!("{} pending transaction(s)", self.pending_txs.len()));
                }
                None => self.status = Some("expected FROM,TO,AMOUNT with AMOUNT > 0".into()),
            },
        }
    }

    /// Index and previous hash the demo block would get if appended now.
    fn demo_link(&self) -> (u64, HexDigest) {
        let previous_hash = self
            .snapshot
            .blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_default();
        (self.snapshot.len() as u64, previous_hash)
    }

    fn update_hash_demo(&mut self) {
        let (index, previous_hash) = self.demo_link();
        self.hash_output = calculate_hash(
            index,
            self.hash_timestamp,
            &Payload::from(self.hash_input.as_str()),
            &previous_hash,
            self.hash_nonce,
        );
        self.hash_leading_zeros = leading_zero_digits(&self.hash_output);
    }

    fn step_demo_nonce(&mut self, up: bool) {
        self.hash_nonce = if up {
            self.hash_nonce.saturating_add(1)
        } else {
            self.hash_nonce.saturating_sub(1)
        };
        self.update_hash_demo();
    }

    /// Jump to the next nonce, from the current one, that meets the
    /// difficulty for new blocks.
    fn find_demo_nonce(&mut self) {
        let difficulty = self.snapshot.difficulty;
        if difficulty > DEMO_SEARCH_MAX_DIFFICULTY {
            self.status = Some(format!(
                "search here stops at difficulty {DEMO_SEARCH_MAX_DIFFICULTY}; mine from the Chain tab"
            ));
            return;
        }
        let (index, previous_hash) = self.demo_link();
        let payload = Payload::from(self.hash_input.as_str());
        let mut block = ChainBlock::new(0, index, payload, previous_hash, difficulty);
        block.timestamp = self.hash_timestamp;
        block.nonce = self.hash_nonce;
        match mine::mine_parallel(block) {
            Ok(mined) => {
                self.status = Some(format!(
                    "nonce {} gives {difficulty} leading zeros after {} more attempts",
                    mined.nonce,
                    mined.nonce - self.hash_nonce
                ));
                self.hash_nonce = mined.nonce;
            }
            Err(e) => self.status = Some(e.to_string()),
        }
        self.update_hash_demo();
    }
}

fn parse_tx(input: &str) -> Option<Transaction> {
    let mut parts = input.split(',').map(str::trim);
    let (from, to, amount) = (parts.next()?, parts.next()?, parts.next()?);
    let amount = Transaction::parse_amount(amount)?;
    if from.is_empty() || to.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(Transaction::new(from, to, amount))
}

#[tokio::main]
async fn main() -> Result<()> {
    // tracing goes to stderr so it does not tear the alternate screen
    if std::env::var_os("RUST_LOG").is_some() {
        fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(io::stderr)
            .with_target(false)
            .init();
    }

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    if let Some(difficulty) = args.difficulty {
        config.initial_difficulty = difficulty;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;
    info!(
        difficulty = config.initial_difficulty,
        batch_size = config.batch_size,
        "starting tui"
    );

    // terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(Engine::new(config));
    let res = run_app(&mut terminal, &mut app).await;

    // restore
    disable_raw_mode()?;
    crossterm::execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    loop {
        app.refresh();
        terminal.draw(|f| ui(f, app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(app, key) {
                    break;
                }
            }
        }
        // let mining tasks run their next batch
        tokio::task::yield_now().await;
    }
    for handle in app.mining.values() {
        handle.cancel();
    }
    Ok(())
}

/// Returns true when the app should quit.
fn handle_key(app: &mut App, key: KeyEvent) -> bool {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    if ctrl && key.code == KeyCode::Char('c') {
        return true;
    }

    if let Some(buffer) = app.editing.as_mut() {
        match key.code {
            KeyCode::Esc => app.editing = None,
            KeyCode::Enter => app.commit_edit(),
            KeyCode::Backspace => {
                buffer.pop();
            }
            KeyCode::Char(c) if !c.is_control() => buffer.push(c),
            _ => {}
        }
        return false;
    }

    match key.code {
        KeyCode::Esc => return true,
        KeyCode::Tab => {
            app.tab = match app.tab {
                Tab::Chain => Tab::AddBlock,
                Tab::AddBlock => Tab::HashDemo,
                Tab::HashDemo => Tab::Chain,
            };
        }
        KeyCode::BackTab => {
            app.tab = match app.tab {
                Tab::Chain => Tab::HashDemo,
                Tab::AddBlock => Tab::Chain,
                Tab::HashDemo => Tab::AddBlock,
            };
        }
        _ => match app.tab {
            Tab::Chain => match key.code {
                KeyCode::Down => app.next_row(),
                KeyCode::Up => app.previous_row(),
                KeyCode::Left => app.change_difficulty(false),
                KeyCode::Right => app.change_difficulty(true),
                KeyCode::Char('m') => app.mine_selected(),
                KeyCode::Char('c') => app.cancel_selected(),
                KeyCode::Char('e') => app.begin_edit(),
                KeyCode::Char('[') => app.move_selected(true),
                KeyCode::Char(']') => app.move_selected(false),
                KeyCode::Char('v') => {
                    app.engine.revalidate();
                    app.refresh();
                    app.status = Some("revalidated every block strictly".into());
                }
                KeyCode::Char('p') => app.detail_popup = !app.detail_popup,
                KeyCode::Char('X') => {
                    for handle in app.mining.values() {
                        handle.cancel();
                    }
                    app.engine.reset();
                    app.refresh();
                    app.status = Some("chain reset".into());
                }
                _ => {}
            },
            Tab::AddBlock => match key.code {
                KeyCode::F(2) => {
                    app.add_mode = match app.add_mode {
                        AddMode::Text => AddMode::Transactions,
                        AddMode::Transactions => AddMode::Text,
                    };
                }
                KeyCode::Char(c) if !c.is_control() => app.add_input.push(c),
                KeyCode::Backspace => {
                    app.add_input.pop();
                }
                KeyCode::Enter => app.submit_add(),
                _ => {}
            },
            Tab::HashDemo => match key.code {
                KeyCode::Char(c) if !c.is_control() => {
                    app.hash_input.push(c);
                    app.update_hash_demo();
                }
                KeyCode::Backspace => {
                    app.hash_input.pop();
                    app.update_hash_demo();
                }
                KeyCode::Up => app.step_demo_nonce(true),
                KeyCode::Down => app.step_demo_nonce(false),
                KeyCode::Enter => app.find_demo_nonce(),
                _ => {}
            },
        },
    }
    false
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.area();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
            Constraint::Length(3),
        ])
        .split(size);

    let titles = ["Chain", "Add block", "HashDemo"]
        .iter()
        .map(|t| Line::from(*t))
        .collect::<Vec<_>>();
    let chain_flag = if app.snapshot.is_valid_chain {
        Span::styled(" chain valid ", Style::default().fg(Color::Green))
    } else {
        Span::styled(" chain INVALID ", Style::default().fg(Color::Red))
    };
    let tabs = Tabs::new(titles)
        .select(app.tab as usize)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("blockviz")
                .title(Line::from(chain_flag).right_aligned()),
        )
        .style(Style::default().fg(Color::Green))
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match app.tab {
        Tab::Chain => render_chain(f, chunks[1], app),
        Tab::AddBlock => render_add(f, chunks[1], app),
        Tab::HashDemo => render_hashdemo(f, chunks[1], app),
    }

    let status = Paragraph::new(app.status.clone().unwrap_or_default())
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(status, chunks[2]);

    let help = Paragraph::new(
        "ESC quit • TAB next tab • Chain: ↑/↓ select, ←/→ difficulty, m mine, c cancel, e edit, [ ] move, v revalidate, p details, X reset")
        .style(Style::default().fg(Color::DarkGray))
        .block(Block::default().borders(Borders::ALL).title("help"));
    f.render_widget(help, chunks[3]);
}

fn render_chain(f: &mut Frame, area: Rect, app: &mut App) {
    let selected = app.selected();
    let rows = app.snapshot.blocks.iter().enumerate().map(|(i, b)| {
        let status = if b.is_mining {
            let nonce = app.snapshot.mining_progress.get(&i).copied().unwrap_or_default();
            format!("mining {nonce}")
        } else if b.is_mined {
            "mined".to_string()
        } else {
            "unmined".to_string()
        };
        let colour = if b.is_mining {
            Color::Yellow
        } else if b.is_valid {
            Color::Green
        } else {
            Color::Red
        };
        let style = if Some(i) == selected {
            Style::default().fg(colour).add_modifier(Modifier::REVERSED)
        } else {
            Style::default().fg(colour)
        };
        Row::new(vec![
            Cell::from(b.index.to_string()),
            Cell::from(if b.is_valid { "✓" } else { "✗" }),
            Cell::from(status),
            Cell::from(b.difficulty.to_string()),
            Cell::from(b.nonce.to_string()),
            Cell::from(short(&b.hash).to_string()),
            Cell::from(short(&b.previous_hash).to_string()),
            Cell::from(b.payload.to_string()),
        ])
        .style(style)
    });
    let table = Table::new(
        rows,
        vec![
            Constraint::Length(5),
            Constraint::Length(5),
            Constraint::Length(16),
            Constraint::Length(5),
            Constraint::Length(10),
            Constraint::Length(SHORT_HASH as u16 + 2),
            Constraint::Length(SHORT_HASH as u16 + 2),
            Constraint::Min(10),
        ],
    )
    .header(
        Row::new(vec!["idx", "ok", "status", "diff", "nonce", "hash", "prev", "data"])
            .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::ALL).title(format!(
        "Chain blocks (next difficulty {})",
        app.snapshot.difficulty
    )));
    f.render_stateful_widget(table, area, &mut app.chain_state);

    if app.detail_popup {
        let popup = Block::bordered()
            .style(Style::default().bg(Color::Black).fg(Color::Yellow))
            .title("Block details")
            .title_style(Style::new().yellow().bold())
            .border_style(Style::new().red().bold());
        let items = match selected.and_then(|i| app.snapshot.blocks.get(i).map(|b| (i, b))) {
            None => vec!["No block selected".to_string()],
            Some((i, b)) => {
                let previous = i.checked_sub(1).and_then(|p| app.snapshot.blocks.get(p));
                let verdict = match check_block(b, previous) {
                    Ok(()) => "passes validation".to_string(),
                    Err(e) => e.to_string(),
                };
                vec![
                    format!(" Index     : {}", b.index),
                    format!(" Timestamp : {}", b.timestamp),
                    format!(" Nonce     : {}", b.nonce),
                    format!(" Difficulty: {}", b.difficulty),
                    format!(" Hash      : {}", b.hash),
                    format!(" Prev hash : {}", b.previous_hash),
                    format!(" Mined     : {}", b.is_mined),
                    format!(" Valid     : {}", b.is_valid),
                    format!(" Check     : {verdict}"),
                    format!(" Data      : {}", b.payload),
                ]
            }
        };
        let list = List::new(items).block(popup.clone());
        let popup_area = centered_area(area, 80, 60);
        f.render_widget(Clear, popup_area);
        f.render_widget(popup, popup_area);
        f.render_widget(list, popup_area);
    }

    if let Some(buffer) = &app.editing {
        let popup_area = centered_area(area, 60, 20);
        let editor = Paragraph::new(buffer.as_str())
            .wrap(Wrap { trim: false })
            .block(
                Block::bordered()
                    .title("Edit block data (Enter apply, Esc cancel)")
                    .border_style(Style::new().yellow().bold()),
            );
        f.render_widget(Clear, popup_area);
        f.render_widget(editor, popup_area);
    }
}

fn render_add(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    let (mode, hint) = match app.add_mode {
        AddMode::Text => ("text", "type block data, Enter to append"),
        AddMode::Transactions => (
            "transactions",
            "FROM,TO,AMOUNT then Enter to queue; Enter on empty input appends the block",
        ),
    };
    let mode = Paragraph::new(format!("Mode: {mode}   (F2 to switch)   {hint}"))
        .block(Block::default().borders(Borders::ALL).title("New block"));
    f.render_widget(mode, chunks[0]);

    let input = Paragraph::new(app.add_input.clone())
        .block(Block::default().borders(Borders::ALL).title("Input"));
    f.render_widget(input, chunks[1]);

    let rows = app.pending_txs.iter().enumerate().map(|(i, tx)| {
        Row::new(vec![
            Cell::from(i.to_string()),
            Cell::from(tx.from.clone()),
            Cell::from(tx.to.clone()),
            Cell::from(tx.amount.to_string()),
            Cell::from(tx.id.clone()),
        ])
    });
    let table = Table::new(
        rows,
        vec![
            Constraint::Length(4),
            Constraint::Length(20),
            Constraint::Length(20),
            Constraint::Length(12),
            Constraint::Length(34),
        ],
    )
    .header(
        Row::new(vec!["idx", "from", "to", "amount", "id"])
            .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("Pending transactions"),
    );
    f.render_widget(table, chunks[2]);
}

fn render_hashdemo(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(8),
            Constraint::Length(4),
            Constraint::Min(0),
        ])
        .split(area);

    let (index, previous_hash) = app.demo_link();
    let fields = Paragraph::new(format!(
        " index     : {index}\n timestamp : {}\n data      : {}\n prev hash : {previous_hash}\n nonce     : {}",
        app.hash_timestamp, app.hash_input, app.hash_nonce
    ))
    .wrap(Wrap { trim: false })
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("Next block fields"),
    );
    f.render_widget(fields, chunks[0]);

    let difficulty = app.snapshot.difficulty;
    let verdict = if is_valid_hash(&app.hash_output, difficulty) {
        "meets"
    } else {
        "misses"
    };
    let out = Paragraph::new(format!(
        "sha256: {}\nleading zero digits: {} ({verdict} difficulty {difficulty})",
        app.hash_output, app.hash_leading_zeros
    ))
    .block(Block::default().borders(Borders::ALL).title("Output"));
    f.render_widget(out, chunks[1]);

    let help = Paragraph::new(
        "Type to change the data, ↑/↓ to step the nonce, Enter to search for the next nonce that meets the difficulty. Each extra leading zero digit is 16 times harder to find.",
    )
    .wrap(Wrap { trim: true })
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, chunks[2]);
}

/// Create a centered rect using the given percentage of the available rect
fn centered_area(area: Rect, percent_x: u16, percent_y: u16) -> Rect {
    let vertical = Layout::vertical([Constraint::Percentage(percent_y)]).flex(Flex::Center);
    let [area] = vertical.areas(area);

    let horizontal = Layout::horizontal([Constraint::Percentage(percent_x)]).flex(Flex::Center);
    let [area] = horizontal.areas(area);

    area
}
