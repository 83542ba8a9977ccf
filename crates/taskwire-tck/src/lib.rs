#![doc = r#"
# taskwire-tck

## 章节定位（Why）
- **目标**：为每个传输后端提供同一套行为契约断言，保证 TCP、Fabric 与进程内后端在
  消息语义、关闭语义与监听器语义上不可区分；
- **使用方式**：后端 crate 以 dev-dependency 引入，在 `tests/tck.rs` 中构造 [`Harness`]
  并逐项调用断言函数。

## 结构概览（How）
- `harness`：被测后端、建连参数与通用处理器（echo / pong）；
- `session`：Comm 生命周期、保序、超时与地址对称性；
- `payload`：主机与设备零拷贝负载、数组序列化桥；
- `listener`：端口 0、处理器失败隔离、停止释放与拒绝连接；
- `corrupt`：伪造帧构造器，流式后端在真实套接字上验证解码上限。

## 约定（What）
- 所有断言返回 `anyhow::Result<()>`，每个等待步骤都受 [`STEP_TIMEOUT`] 限制，
  回归时给出定位信息而不是挂起测试进程。
"#]

pub mod corrupt;
pub mod harness;
pub mod listener;
pub mod payload;
pub mod session;

pub use harness::{Harness, STEP_TIMEOUT, echo_handler, ping, pong_handler, within};
