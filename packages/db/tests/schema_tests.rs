mod common;

use std::error::Error;

use jobstore_db::{
    REQUIRED_SCHEMA_VERSION, StoreContext, StoreError, connect, init_schema, stored_schema_version,
    write_schema_version,
};

use common::test_options;

async fn bare_context() -> Result<StoreContext, StoreError> {
    let options = test_options();
    let db = connect(&options).await?;
    StoreContext::new(db, options)
}

#[tokio::test]
async fn fresh_store_gets_the_current_version() -> Result<(), Box<dyn Error>> {
    let ctx = bare_context().await?;
    assert_eq!(stored_schema_version(&ctx).await?, None);

    init_schema(&ctx).await?;
    assert_eq!(stored_schema_version(&ctx).await?, Some(REQUIRED_SCHEMA_VERSION));

    // Idempotent on every startup.
    init_schema(&ctx).await?;
    assert_eq!(stored_schema_version(&ctx).await?, Some(REQUIRED_SCHEMA_VERSION));
    Ok(())
}

#[tokio::test]
async fn older_version_is_upgraded() -> Result<(), Box<dyn Error>> {
    let ctx = bare_context().await?;
    init_schema(&ctx).await?;
    write_schema_version(&ctx, 3).await?;

    init_schema(&ctx).await?;
    assert_eq!(stored_schema_version(&ctx).await?, Some(REQUIRED_SCHEMA_VERSION));
    Ok(())
}

#[tokio::test]
async fn newer_version_is_rejected() -> Result<(), Box<dyn Error>> {
    let ctx = bare_context().await?;
    init_schema(&ctx).await?;
    write_schema_version(&ctx, REQUIRED_SCHEMA_VERSION + 1).await?;

    let result = init_schema(&ctx).await;
    match result {
        Err(StoreError::SchemaIncompatible { stored, required }) => {
            assert_eq!(stored, REQUIRED_SCHEMA_VERSION + 1);
            assert_eq!(required, REQUIRED_SCHEMA_VERSION);
        }
        other => panic!("expected SchemaIncompatible, got {:?}", other),
    }

    // The marker is left alone.
    assert_eq!(stored_schema_version(&ctx).await?, Some(REQUIRED_SCHEMA_VERSION + 1));
    Ok(())
}

#[tokio::test]
async fn tables_use_the_configured_prefix() -> Result<(), Box<dyn Error>> {
    let storage = common::setup_storage_with(test_options().with_prefix("tenant_a")).await?;
    let c = storage.context().collections();
    assert_eq!(c.job, "tenant_a_job");
    assert_eq!(c.schema, "tenant_a_schema");

    let job_id = common::create_job(&storage, "Run").await?;
    let mut response = storage
        .context()
        .db()
        .query("SELECT VALUE record::id(id) FROM tenant_a_job;")
        .await?;
    let ids: Vec<String> = response.take(0)?;
    assert_eq!(ids, [job_id.to_string()]);
    Ok(())
}
