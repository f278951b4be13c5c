//! Barttorvik team ratings.
//!
//! `{season}_team_results.json` is an array of arrays:
//! [0]=Rank, [1]=Team, [2]=Conf, [3]=Record, [4]=AdjOE, [6]=AdjDE,
//! [8]=Barthag, [10]=EFG%, [11]=EFGD%, [12]=TOR, [13]=TORD, [14]=ORB,
//! [15]=DRB, [16]=FTR, [17]=FTRD, ... [44]=AdjTempo, [45]=WAB.
//! Rows shorter than 46 entries are skipped. Arrays of objects keyed by the
//! same metric names are accepted as well.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::FetchError;
use crate::fetch::{FetchRequest, Payload, Provider};

const MIN_ROW_LEN: usize = 46;

#[derive(Debug, Clone)]
pub struct RatingsFeed {
    pub base_url: String,
    pub season: i32,
}

impl RatingsFeed {
    pub fn new(base_url: impl Into<String>, season: i32) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            season,
        }
    }

    pub fn request(&self) -> FetchRequest {
        FetchRequest::new(format!("{}/{}_team_results.json", self.base_url, self.season))
            .label(format!("ratings:{}", self.season))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamRatingRow {
    pub team: String,
    pub conference: Option<String>,
    pub rank: Option<i32>,
    pub wins: Option<i32>,
    pub losses: Option<i32>,
    pub adj_o: f64,
    pub adj_d: f64,
    pub tempo: f64,
    pub barthag: Option<f64>,
    pub wab: Option<f64>,
    pub efg: Option<f64>,
    pub efgd: Option<f64>,
    pub tor: Option<f64>,
    pub tord: Option<f64>,
    pub orb: Option<f64>,
    pub drb: Option<f64>,
    pub ftr: Option<f64>,
    pub ftrd: Option<f64>,
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// "W-L" into (wins, losses).
fn parse_record(record: &str) -> (Option<i32>, Option<i32>) {
    match record.split_once('-') {
        Some((w, l)) => (w.trim().parse().ok(), l.trim().parse().ok()),
        None => (None, None),
    }
}

fn from_array(raw: &[Value]) -> Option<TeamRatingRow> {
    if raw.len() < MIN_ROW_LEN {
        return None;
    }
    let (wins, losses) = text(raw.get(3))
        .map(|r| parse_record(&r))
        .unwrap_or((None, None));

    Some(TeamRatingRow {
        team: text(raw.get(1)).unwrap_or_default(),
        conference: text(raw.get(2)),
        rank: number(raw.get(0)).map(|v| v as i32),
        wins,
        losses,
        adj_o: number(raw.get(4))?,
        adj_d: number(raw.get(6))?,
        tempo: number(raw.get(44))?,
        barthag: number(raw.get(8)),
        wab: number(raw.get(45)),
        efg: number(raw.get(10)),
        efgd: number(raw.get(11)),
        tor: number(raw.get(12)),
        tord: number(raw.get(13)),
        orb: number(raw.get(14)),
        drb: number(raw.get(15)),
        ftr: number(raw.get(16)),
        ftrd: number(raw.get(17)),
    })
}

fn from_object(raw: &Map<String, Value>) -> Option<TeamRatingRow> {
    let (wins, losses) = match (number(raw.get("wins")), number(raw.get("losses"))) {
        (Some(w), Some(l)) => (Some(w as i32), Some(l as i32)),
        _ => text(raw.get("record"))
            .map(|r| parse_record(&r))
            .unwrap_or((None, None)),
    };

    Some(TeamRatingRow {
        team: text(raw.get("team")).unwrap_or_default(),
        conference: text(raw.get("conf")),
        rank: number(raw.get("rk").or_else(|| raw.get("rank"))).map(|v| v as i32),
        wins,
        losses,
        adj_o: number(raw.get("adjoe"))?,
        adj_d: number(raw.get("adjde"))?,
        tempo: number(raw.get("adj_t"))?,
        barthag: number(raw.get("barthag")),
        wab: number(raw.get("wab")),
        efg: number(raw.get("efg_o")),
        efgd: number(raw.get("efg_d")),
        tor: number(raw.get("tor")),
        tord: number(raw.get("tord")),
        orb: number(raw.get("orb")),
        drb: number(raw.get("drb")),
        ftr: number(raw.get("ftr")),
        ftrd: number(raw.get("ftrd")),
    })
}

/// Incomplete rows and rows without a team name are skipped with a warning.
pub fn parse_ratings(payload: &Payload) -> Result<Vec<TeamRatingRow>, FetchError> {
    let rows: Vec<Value> = serde_json::from_str(&payload.body).map_err(|e| {
        FetchError::malformed(Provider::Ratings, format!("failed to decode ratings: {e}"))
    })?;

    let mut skipped = 0usize;
    let mut parsed = Vec::with_capacity(rows.len());
    for row in &rows {
        let team = match row {
            Value::Array(values) => from_array(values),
            Value::Object(fields) => from_object(fields),
            _ => None,
        };
        match team {
            Some(team) if !team.team.is_empty() => parsed.push(team),
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!("Skipped {} incomplete ratings rows", skipped);
    }
    if parsed.is_empty() && !rows.is_empty() {
        return Err(FetchError::malformed(
            Provider::Ratings,
            "no usable rows in ratings payload",
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn payload(body: Value) -> Payload {
        Payload {
            provider: Provider::Ratings,
            status: 200,
            body: body.to_string(),
            fetched_at: Utc::now(),
            attempts: 1,
            quota: None,
        }
    }

    fn array_row(team: &str, adj_o: f64, adj_d: f64, tempo: f64) -> Value {
        let mut row = vec![json!(0.0); MIN_ROW_LEN];
        row[0] = json!(1);
        row[1] = json!(team);
        row[2] = json!("B10");
        row[3] = json!("20-5");
        row[4] = json!(adj_o);
        row[6] = json!(adj_d);
        row[8] = json!(0.93);
        row[44] = json!(tempo);
        row[45] = json!(6.2);
        Value::Array(row)
    }

    #[test]
    fn parses_array_rows_by_position() {
        let rows = parse_ratings(&payload(json!([array_row("Purdue", 124.1, 94.3, 66.8)])))
            .unwrap();
        assert_eq!(rows.len(), 1);
        let purdue = &rows[0];
        assert_eq!(purdue.team, "Purdue");
        assert_eq!(purdue.adj_o, 124.1);
        assert_eq!(purdue.tempo, 66.8);
        assert_eq!((purdue.wins, purdue.losses), (Some(20), Some(5)));
        assert_eq!(purdue.wab, Some(6.2));
    }

    #[test]
    fn skips_short_and_nameless_rows() {
        let body = json!([
            array_row("Purdue", 124.1, 94.3, 66.8),
            array_row("", 100.0, 100.0, 68.0),
            [1, "Short Row", "ACC"]
        ]);
        let rows = parse_ratings(&payload(body)).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn accepts_object_rows() {
        let body = json!([
            {"team": "Houston", "conf": "B12", "adjoe": "119.5", "adjde": 87.1, "adj_t": 63.2, "record": "30-4"}
        ]);
        let rows = parse_ratings(&payload(body)).unwrap();
        assert_eq!(rows[0].adj_o, 119.5);
        assert_eq!(rows[0].wins, Some(30));
    }

    #[test]
    fn undecodable_body_is_permanent() {
        let bad = Payload {
            body: "<html>".to_string(),
            ..payload(json!([]))
        };
        let err = parse_ratings(&bad).unwrap_err();
        assert!(!err.is_retryable());
    }
}
