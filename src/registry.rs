//! Named multiplexer instances (spec §4.4), mirroring the way the teacher
//! wires singleton services (`SseState`, `ActorRegistry`, `UpstreamManager`)
//! into its `AppState` via `#[derive(FromRef)]` in `main.rs`.

use std::sync::Arc;

use crate::config::{Config, MuxTimings};
use crate::error::MuxError;
use crate::mux::{Multiplexer, UpstreamRequest};
use crate::upstream::Requester;

/// The dependency shape every named instance's `make_key`/`build_request`
/// closures match on. One enum rather than five generic `Multiplexer<D>`
/// instantiations keeps `MuxRegistry` a plain struct of concrete fields.
#[derive(Debug, Clone)]
pub enum StreamDeps {
    Quotes {
        symbols: Vec<String>,
    },
    Bars {
        ticker: String,
        interval: u32,
        unit: String,
        barsback: u32,
        session_template: String,
    },
    MarketDepth {
        ticker: String,
        maxlevels: u32,
    },
    Positions {
        account_id: String,
        paper_trading: bool,
    },
    Orders {
        account_id: String,
        paper_trading: bool,
    },
}

fn base_url(config: &Config, paper_trading: bool) -> &str {
    if paper_trading {
        &config.upstream_base_url_paper
    } else {
        &config.upstream_base_url_live
    }
}

/// Normalizes a user-supplied symbol list the way spec.md §3 requires:
/// upper-cased and deduplicated before it becomes part of a key.
pub fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = symbols.iter().map(|s| s.to_uppercase()).collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

pub struct MuxRegistry {
    pub quotes: Arc<Multiplexer<StreamDeps>>,
    pub bars: Arc<Multiplexer<StreamDeps>>,
    pub market_depth: Arc<Multiplexer<StreamDeps>>,
    pub positions: Arc<Multiplexer<StreamDeps>>,
    pub orders: Arc<Multiplexer<StreamDeps>>,
}

impl MuxRegistry {
    pub fn new(config: Arc<Config>, requester: Arc<dyn Requester>) -> Self {
        let timings = MuxTimings::default();

        let quotes = Multiplexer::new(
            "quotes",
            false,
            timings,
            requester.clone(),
            Box::new(|user_id, deps| match deps {
                StreamDeps::Quotes { symbols } => {
                    Ok(format!("{user_id}|{}", normalize_symbols(symbols).join(",")))
                }
                _ => Err(MuxError::BadRequest("expected quote deps".into())),
            }),
            Box::new({
                let config = config.clone();
                move |_user_id, deps| match deps {
                    StreamDeps::Quotes { symbols } => {
                        let symbols = normalize_symbols(symbols);
                        if symbols.is_empty() {
                            return Err(MuxError::BadRequest("symbols must not be empty".into()));
                        }
                        Ok(UpstreamRequest {
                            url: format!(
                                "{}/marketdata/stream/quotes/{}",
                                base_url(&config, false),
                                symbols.join(",")
                            ),
                        })
                    }
                    _ => Err(MuxError::BadRequest("expected quote deps".into())),
                }
            }),
        );

        // Exclusive: a user watches at most one bars interval/ticker at a
        // time, switching evicts the previous key (spec.md's Glossary and
        // scenario S3).
        let bars = Multiplexer::new(
            "bars",
            true,
            timings,
            requester.clone(),
            Box::new(|user_id, deps| match deps {
                StreamDeps::Bars {
                    ticker,
                    interval,
                    unit,
                    barsback,
                    session_template,
                } => Ok(format!(
                    "{user_id}|{ticker}|{interval}|{unit}|{barsback}|{session_template}"
                )),
                _ => Err(MuxError::BadRequest("expected bar deps".into())),
            }),
            Box::new({
                let config = config.clone();
                move |_user_id, deps| match deps {
                    StreamDeps::Bars {
                        ticker,
                        interval,
                        unit,
                        barsback,
                        session_template,
                    } => Ok(UpstreamRequest {
                        url: format!(
                            "{}/marketdata/stream/barcharts/{}?interval={}&unit={}&barsback={}&sessiontemplate={}",
                            base_url(&config, false),
                            ticker, interval, unit, barsback, session_template
                        ),
                    }),
                    _ => Err(MuxError::BadRequest("expected bar deps".into())),
                }
            }),
        );

        let market_depth = Multiplexer::new(
            "market_depth",
            false,
            timings,
            requester.clone(),
            Box::new(|user_id, deps| match deps {
                StreamDeps::MarketDepth { ticker, maxlevels } => {
                    Ok(format!("{user_id}|{ticker}|{maxlevels}"))
                }
                _ => Err(MuxError::BadRequest("expected market-depth deps".into())),
            }),
            Box::new({
                let config = config.clone();
                move |_user_id, deps| match deps {
                    StreamDeps::MarketDepth { ticker, maxlevels } => Ok(UpstreamRequest {
                        url: format!(
                            "{}/marketdata/stream/marketdepth/aggregates/{}?maxlevels={}",
                            base_url(&config, false),
                            ticker, maxlevels
                        ),
                    }),
                    _ => Err(MuxError::BadRequest("expected market-depth deps".into())),
                }
            }),
        );

        let positions = Multiplexer::new(
            "positions",
            false,
            timings,
            requester.clone(),
            Box::new(|user_id, deps| match deps {
                StreamDeps::Positions {
                    account_id,
                    paper_trading,
                } => Ok(format!("{user_id}|{account_id}|{paper_trading}")),
                _ => Err(MuxError::BadRequest("expected position deps".into())),
            }),
            Box::new({
                let config = config.clone();
                move |_user_id, deps| match deps {
                    StreamDeps::Positions {
                        account_id,
                        paper_trading,
                    } => Ok(UpstreamRequest {
                        url: format!(
                            "{}/brokerage/stream/accounts/{}/positions",
                            base_url(&config, *paper_trading),
                            account_id
                        ),
                    }),
                    _ => Err(MuxError::BadRequest("expected position deps".into())),
                }
            }),
        );

        let orders = Multiplexer::new(
            "orders",
            false,
            timings,
            requester.clone(),
            Box::new(|user_id, deps| match deps {
                StreamDeps::Orders {
                    account_id,
                    paper_trading,
                } => Ok(format!("{user_id}|{account_id}|{paper_trading}")),
                _ => Err(MuxError::BadRequest("expected order deps".into())),
            }),
            Box::new({
                let config = config.clone();
                move |_user_id, deps| match deps {
                    StreamDeps::Orders {
                        account_id,
                        paper_trading,
                    } => Ok(UpstreamRequest {
                        url: format!(
                            "{}/brokerage/stream/accounts/{}/orders",
                            base_url(&config, *paper_trading),
                            account_id
                        ),
                    }),
                    _ => Err(MuxError::BadRequest("expected order deps".into())),
                }
            }),
        );

        Self {
            quotes,
            bars,
            market_depth,
            positions,
            orders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_symbols_dedupes_and_upcases() {
        let symbols = vec!["msft".to_string(), "AAPL".to_string(), "aapl".to_string()];
        assert_eq!(normalize_symbols(&symbols), vec!["AAPL", "MSFT"]);
    }
}
