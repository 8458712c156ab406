// AWS Lambda binary entry point; deployed as `bootstrap` on the provided.al2023 runtime.

#[tokio::main]
async fn main() -> Result<(), lambda_runtime::Error> {
    iam_collector_lambda::run().await
}
