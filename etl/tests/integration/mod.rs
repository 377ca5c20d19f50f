mod checkpoint_test;
mod export_test;
mod pipeline_test;
