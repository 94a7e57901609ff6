use anyhow::Result;
use question_forge::utils::logging;
use question_forge::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志（配置解析的警告也需要输出）
    let verbose = std::env::var("VERBOSE_LOGGING").is_ok_and(|v| v == "true");
    logging::init(verbose);

    // 加载配置
    let config = Config::from_env();

    // 命令行参数为需要处理的单元 id，留空则处理全部
    let only: Vec<String> = std::env::args().skip(1).collect();

    // 初始化并运行应用
    let run = App::initialize(config).await?.run(&only).await?;

    if run.units_failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
