//! Python snippet templates for `generate_python_code`.

/// Pick a template for `description`: BigFrames when it mentions bigframes, Polars otherwise.
pub fn generate_python_code(description: &str) -> String {
    if description.to_lowercase().contains("bigframes") {
        bigframes_snippet(description)
    } else {
        polars_snippet(description)
    }
}

fn bigframes_snippet(description: &str) -> String {
    format!(
        r#"import bigframes.pandas as bfp
from google.cloud import bigquery

# Example using BigFrames for: {description}
client = bigquery.Client()
df = bfp.read_gbq("your_project.your_dataset.your_table")
print(df.head())
"#
    )
}

fn polars_snippet(description: &str) -> String {
    format!(
        r#"import polars as pl
from google.cloud import bigquery

# Example using Polars for: {description}
client = bigquery.Client()
query = '''SELECT * FROM `your_project.your_dataset.your_table` LIMIT 100'''
df = pl.read_database(query, connection=client)
print(df.head())
"#
    )
}
