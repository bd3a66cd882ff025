// Row builders for the SHOW commands.

use bytes::{BufMut, BytesMut};

use crate::client::registry;
use crate::messages::{command_complete, data_row, ready_for_query, row_description};
use crate::pool::get_pool;
use crate::servers;
use crate::stats;

fn result_set(columns: &[&str], rows: Vec<Vec<String>>) -> BytesMut {
    let mut buf = row_description(columns);
    let count = rows.len();
    for row in rows {
        buf.put(data_row(&row));
    }
    buf.put(command_complete(&format!("SELECT {count}")));
    buf.put(ready_for_query(false));
    buf
}

pub(crate) fn show_servers() -> BytesMut {
    let rows = servers::get_servers()
        .iter()
        .map(|server| {
            vec![
                server.name.clone(),
                server.host.clone(),
                server.port.to_string(),
                server.state().to_string(),
            ]
        })
        .collect();

    result_set(&["name", "host", "port", "state"], rows)
}

pub(crate) fn show_pools() -> BytesMut {
    let rows = match get_pool() {
        Some(pool) => pool
            .limits()
            .iter()
            .map(|rule| {
                vec![
                    rule.database.clone(),
                    rule.username.clone(),
                    rule.active_connections
                        .load(std::sync::atomic::Ordering::Acquire)
                        .to_string(),
                    rule.max_size.to_string(),
                    rule.initial_size.to_string(),
                    rule.min_size.to_string(),
                ]
            })
            .collect(),
        None => Vec::new(),
    };

    result_set(
        &["database", "user", "active", "max_size", "initial_size", "min_size"],
        rows,
    )
}

pub(crate) fn show_clients() -> BytesMut {
    let rows = registry::snapshot()
        .into_iter()
        .map(|(id, addr, username, database, idle)| {
            vec![
                id.to_string(),
                addr,
                username,
                database,
                idle.to_string(),
            ]
        })
        .collect();

    result_set(&["id", "addr", "user", "database", "idle_seconds"], rows)
}

pub(crate) fn show_status() -> BytesMut {
    let mut rows: Vec<Vec<String>> = stats::snapshot()
        .into_iter()
        .map(|(key, value)| vec![key.to_string(), value.to_string()])
        .collect();

    if let Some(pool) = get_pool() {
        rows.push(vec![
            "active_connections".to_string(),
            pool.active_connections().to_string(),
        ]);
        rows.push(vec![
            "max_connections".to_string(),
            pool.max_connections().to_string(),
        ]);
    }
    rows.push(vec![
        "clients".to_string(),
        registry::count().to_string(),
    ]);

    result_set(&["name", "value"], rows)
}
