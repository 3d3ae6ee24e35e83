//! Looks up the compiled policy graph's category names, the list the
//! adjudicator's category classifier picks from (§4.Q.2).

use refund_graph_store::GraphStore;

pub async fn fetch_available_categories(graph: &GraphStore) -> Result<Vec<String>, refund_graph_store::GraphStoreError> {
    let rows = graph.execute_read("MATCH (c:Category) RETURN c.name AS name", vec![]).await?;
    let mut names: Vec<String> = rows.iter().filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(str::to_string)).collect();
    names.sort();
    names.dedup();
    Ok(names)
}
