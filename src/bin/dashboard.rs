use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use anyhow::Context;
use ratatui::{
    backend::CrosstermBackend,
    crossterm::{
        event::{self, Event, KeyCode, KeyModifiers},
        execute,
        terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    },
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::Span,
    widgets::{Block, Borders, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use tokio::sync::{mpsc, watch};

use hedgescope::config::EngineConfig;
use hedgescope::exchange::AdapterSet;
use hedgescope::strategy::spread_poller::{DepthLevel, LiveSpreadPoller, SpreadConfig, SpreadSnapshot};
use hedgescope::strategy::types::{ArbitrageOpportunity, MarketKind};
use hedgescope::strategy::worker::{EngineRequest, ResponseData, SignalEngine};
use hedgescope::utils;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const MAX_REMOVED: usize = 10;

type RefreshResult = Result<Vec<ArbitrageOpportunity>, String>;

#[derive(Clone, Debug)]
struct RemovedOpportunity {
    token: String,
    pair: String,
    last_apr: f64,
}

struct AppState {
    opportunities: Vec<ArbitrageOpportunity>,
    removed: VecDeque<RemovedOpportunity>,
    table: TableState,
    last_refresh: Option<String>,
    last_error: Option<String>,
    poller: LiveSpreadPoller,
    spread_rx: watch::Receiver<Option<SpreadSnapshot>>,
    should_quit: bool,
}

impl AppState {
    fn new(poller: LiveSpreadPoller) -> Self {
        let spread_rx = poller.subscribe();
        Self {
            opportunities: Vec::new(),
            removed: VecDeque::with_capacity(MAX_REMOVED),
            table: TableState::default(),
            last_refresh: None,
            last_error: None,
            poller,
            spread_rx,
            should_quit: false,
        }
    }

    fn apply_refresh(&mut self, result: RefreshResult) {
        self.last_refresh = Some(utils::ts_hm());
        let fresh = match result {
            Ok(fresh) => {
                self.last_error = None;
                fresh
            }
            Err(e) => {
                self.last_error = Some(e);
                return;
            }
        };

        for old in &self.opportunities {
            let still_there = fresh.iter().any(|o| {
                o.base_token == old.base_token
                    && o.buy_exchange == old.buy_exchange
                    && o.sell_exchange == old.sell_exchange
            });
            if !still_there {
                if self.removed.len() >= MAX_REMOVED {
                    self.removed.pop_front();
                }
                self.removed.push_back(RemovedOpportunity {
                    token: old.base_token.clone(),
                    pair: format!("{} / {}", old.buy_exchange, old.sell_exchange),
                    last_apr: old.cumulative_apr,
                });
            }
        }

        let selected = self.selected().map(|o| o.base_token.clone());
        self.opportunities = fresh;
        let index = selected
            .and_then(|token| self.opportunities.iter().position(|o| o.base_token == token))
            .or_else(|| (!self.opportunities.is_empty()).then_some(0));
        self.table.select(index);
        self.follow_selection();
    }

    fn selected(&self) -> Option<&ArbitrageOpportunity> {
        self.table.selected().and_then(|i| self.opportunities.get(i))
    }

    fn move_selection(&mut self, delta: isize) {
        if self.opportunities.is_empty() {
            return;
        }
        let last = self.opportunities.len() - 1;
        let current = self.table.selected().unwrap_or(0);
        let next = current.saturating_add_signed(delta).min(last);
        self.table.select(Some(next));
        self.follow_selection();
    }

    /// Point the spread poller at the selected row, restarting only when the
    /// pair actually changed.
    fn follow_selection(&mut self) {
        let wanted = self.selected().map(|o| SpreadConfig {
            base_token: o.base_token.clone(),
            buy_exchange: o.buy_exchange,
            sell_exchange: o.sell_exchange,
            market: MarketKind::Perpetual,
        });

        match wanted {
            Some(config) if self.poller.active() != Some(&config) => {
                if let Err(e) = self.poller.start(config) {
                    self.last_error = Some(e.to_string());
                }
            }
            Some(_) => {}
            None => self.poller.stop(),
        }
    }
}

/// Background refresh loop. Results arrive on `tx`; the loop ends when the
/// UI drops its receiver.
fn spawn_refresh(engine: SignalEngine, config: EngineConfig, tx: mpsc::Sender<RefreshResult>) {
    let handle = engine.spawn();
    let exchanges: Vec<String> = config.exchanges.iter().map(|e| e.as_str().to_string()).collect();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let request = EngineRequest::ProcessMarket {
                tokens: config.tokens.clone(),
                exchanges: exchanges.clone(),
                weeks: config.lookback_weeks,
            };

            let result = match handle.request(request).await {
                Ok(response) if response.is_success() => match response.data {
                    Some(ResponseData::Opportunities(opportunities)) => Ok(opportunities),
                    _ => Err("unexpected engine payload".to_string()),
                },
                Ok(response) => Err(response.error_message.unwrap_or_else(|| "engine error".to_string())),
                Err(e) => Err(e.to_string()),
            };

            if tx.send(result).await.is_err() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let adapters = AdapterSet::live(&config).context("failed to build exchange adapters")?;

    let poller = LiveSpreadPoller::from_config(adapters.clone(), &config);
    let engine = SignalEngine::new(adapters, config.leverage.clone());
    let (tx, mut rx) = mpsc::channel::<RefreshResult>(4);
    spawn_refresh(engine, config.clone(), tx);

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = AppState::new(poller);
    let result = run(&mut terminal, &mut app, &mut rx, &config);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut AppState,
    rx: &mut mpsc::Receiver<RefreshResult>,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    loop {
        while let Ok(result) = rx.try_recv() {
            app.apply_refresh(result);
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => app.should_quit = true,
                    KeyCode::Up => app.move_selection(-1),
                    KeyCode::Down => app.move_selection(1),
                    KeyCode::PageUp => app.move_selection(-10),
                    KeyCode::PageDown => app.move_selection(10),
                    KeyCode::Home => app.move_selection(isize::MIN),
                    KeyCode::End => app.move_selection(isize::MAX),
                    _ => {}
                }
            }
        }

        let spread = app.spread_rx.borrow().clone();
        terminal.draw(|f| ui(f, app, spread.as_ref(), config))?;

        if app.should_quit {
            app.poller.stop();
            return Ok(());
        }
    }
}

fn ui(f: &mut Frame, app: &mut AppState, spread: Option<&SpreadSnapshot>, config: &EngineConfig) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),  // Header
            Constraint::Min(8),     // Opportunities table
            Constraint::Length(9),  // Live spread
            Constraint::Length(7),  // Removed opportunities
            Constraint::Length(2),  // Footer
        ])
        .split(f.size());

    let status = match (&app.last_refresh, &app.last_error) {
        (_, Some(e)) => Span::styled(format!("Refresh failed: {}", e), Style::default().fg(Color::Red)),
        (Some(at), None) => Span::raw(format!("Last refresh {}", at)),
        (None, None) => Span::styled("Loading funding history...", Style::default().fg(Color::Yellow)),
    };
    let header = Paragraph::new(status).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("FUNDING ARBITRAGE ({} week window)", config.lookback_weeks))
            .title_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
    );
    f.render_widget(header, chunks[0]);

    render_opportunities(f, app, chunks[1]);
    render_spread(f, spread, chunks[2]);
    render_removed(f, app, chunks[3]);

    let footer = Paragraph::new("↑↓: Select | PgUp/PgDn: Page | Home/End: Jump | q: Quit")
        .style(Style::default().fg(Color::Gray))
        .block(Block::default().borders(Borders::TOP));
    f.render_widget(footer, chunks[4]);
}

fn render_opportunities(f: &mut Frame, app: &mut AppState, area: Rect) {
    let bold = Style::default().add_modifier(Modifier::BOLD);

    let rows: Vec<Row> = app
        .opportunities
        .iter()
        .map(|opp| {
            let apr_pct = opp.cumulative_apr * 100.0;
            let apr_color = if apr_pct > 50.0 {
                Color::Green
            } else if apr_pct > 15.0 {
                Color::Yellow
            } else {
                Color::White
            };
            Row::new(vec![
                Span::raw(opp.base_token.clone()),
                Span::raw(opp.buy_exchange.to_string()),
                Span::raw(opp.sell_exchange.to_string()),
                Span::raw(format!("{:+.4}%", opp.buy_rate * 100.0)),
                Span::raw(format!("{:+.4}%", opp.sell_rate * 100.0)),
                Span::raw(format!("{:.4}%", opp.cumulative_diff * 100.0)),
                Span::styled(format!("{:.2}%", apr_pct), Style::default().fg(apr_color)),
                Span::raw(format_volume(opp.buy_vol24h.min(opp.sell_vol24h))),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(10), // Token
            Constraint::Length(12), // Long
            Constraint::Length(12), // Short
            Constraint::Length(11), // Long rate
            Constraint::Length(11), // Short rate
            Constraint::Length(11), // Diff
            Constraint::Length(10), // APR
            Constraint::Length(10), // Volume
        ],
    )
    .header(
        Row::new(vec![
            Span::styled("Token", bold),
            Span::styled("Long", bold),
            Span::styled("Short", bold),
            Span::styled("L.Rate", bold),
            Span::styled("S.Rate", bold),
            Span::styled("Diff", bold),
            Span::styled("APR", bold),
            Span::styled("Min Vol", bold),
        ])
        .style(Style::default().fg(Color::Cyan)),
    )
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Opportunities ({} total)", app.opportunities.len())),
    )
    .highlight_style(Style::default().bg(Color::DarkGray));

    f.render_stateful_widget(table, area, &mut app.table);
}

fn render_spread(f: &mut Frame, spread: Option<&SpreadSnapshot>, area: Rect) {
    let block = Block::default().borders(Borders::ALL);
    let Some(s) = spread else {
        f.render_widget(
            Paragraph::new("Waiting for order books...").block(block.title("Live Spread")),
            area,
        );
        return;
    };

    let fmt_spread = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| format!("{:+.4}%", v));
    let sync_style = if s.stale {
        Style::default().fg(Color::Red)
    } else {
        Style::default().fg(Color::Green)
    };
    let title = format!(
        "Live Spread {} | open {} | close {}",
        s.base_token,
        fmt_spread(s.open_spread),
        fmt_spread(s.close_spread)
    );

    let rows: Vec<Row> = (0..5)
        .map(|i| {
            Row::new(vec![
                Span::raw(depth_cell(&s.buy.bids, i)),
                Span::raw(depth_cell(&s.buy.asks, i)),
                Span::raw(depth_cell(&s.sell.bids, i)),
                Span::raw(depth_cell(&s.sell.asks, i)),
            ])
        })
        .collect();

    let bold = Style::default().add_modifier(Modifier::BOLD).fg(Color::Cyan);
    let table = Table::new(rows, [Constraint::Percentage(25); 4])
        .header(Row::new(vec![
            Span::styled(format!("{} bid", s.buy.exchange), bold),
            Span::styled(format!("{} ask", s.buy.exchange), bold),
            Span::styled(format!("{} bid", s.sell.exchange), bold),
            Span::styled(format!("{} ask", s.sell.exchange), bold),
        ]))
        .block(
            block
                .title(title)
                .title_bottom(Span::styled(format!("sync gap {}ms", s.sync_gap_ms), sync_style)),
        );
    f.render_widget(table, area);
}

fn render_removed(f: &mut Frame, app: &AppState, area: Rect) {
    let rows: Vec<Row> = app
        .removed
        .iter()
        .rev()
        .map(|r| {
            Row::new(vec![
                Span::raw(r.token.clone()),
                Span::raw(r.pair.clone()),
                Span::styled(format!("{:.2}%", r.last_apr * 100.0), Style::default().fg(Color::Yellow)),
            ])
        })
        .collect();

    let table = Table::new(rows, [Constraint::Length(10), Constraint::Length(26), Constraint::Min(10)]).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Recently Removed ({} total)", app.removed.len()))
            .style(Style::default().fg(Color::DarkGray)),
    );
    f.render_widget(table, area);
}

fn depth_cell(levels: &[DepthLevel], i: usize) -> String {
    levels
        .get(i)
        .map_or_else(String::new, |l| format!("{} ({})", format_price(l.price), format_volume(l.notional)))
}

// Smart decimal formatting based on price magnitude
fn format_price(price: f64) -> String {
    if price >= 100.0 {
        format!("{:.2}", price)
    } else if price >= 1.0 {
        format!("{:.4}", price)
    } else if price >= 0.01 {
        format!("{:.6}", price)
    } else {
        format!("{:.9}", price)
    }
}

fn format_volume(value: f64) -> String {
    if value >= 1e9 {
        format!("${:.1}B", value / 1e9)
    } else if value >= 1e6 {
        format!("${:.1}M", value / 1e6)
    } else if value >= 1e3 {
        format!("${:.1}K", value / 1e3)
    } else {
        format!("${:.0}", value)
    }
}
